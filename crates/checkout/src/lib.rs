//! Order placement on top of inventory reservations.
//!
//! [`OrderPlacementService`] runs one checkout:
//! 1. Reserve stock for the requested items
//! 2. Re-price every line from the catalog and apply shipping and coupon rules
//! 3. Insert the order and deduct stock in one ledger transaction
//! 4. After the transaction commits, clear the cart and dispatch notifications
//!
//! Any failure before step 3 commits releases the reservation. Failures in
//! step 4 are logged and never undo the order.

pub mod address;
pub mod error;
pub mod placement;
pub mod pricing;
pub mod services;

pub use address::validate_address;
pub use error::{PlacementError, Result, ServiceError};
pub use placement::{OrderPlacementService, PlaceOrderRequest, PlacementOutcome};
pub use pricing::{PricingConfig, Totals};
pub use services::{
    CartStore, Catalog, Coupon, CouponDecision, CouponKind, CouponValidator, Dispatcher,
    Dispatchers, InMemoryCartStore, InMemoryCatalog, InMemoryCouponValidator,
    InMemoryDispatcher, ProductInfo, SideEffectChannel,
};
