//! External collaborators consumed by order placement, with in-memory implementations.

pub mod cart;
pub mod catalog;
pub mod coupon;
pub mod dispatch;

pub use cart::{CartStore, InMemoryCartStore};
pub use catalog::{Catalog, InMemoryCatalog, ProductInfo};
pub use coupon::{Coupon, CouponDecision, CouponKind, CouponValidator, InMemoryCouponValidator};
pub use dispatch::{Dispatcher, Dispatchers, InMemoryDispatcher, SideEffectChannel};
