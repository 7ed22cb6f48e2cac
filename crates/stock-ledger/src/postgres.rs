use async_trait::async_trait;
use common::{Money, OrderId, ProductId, ReservationId, TenantId, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    LedgerError, OrderLine, OrderRecord, Result, ShippingAddress,
    ledger::{LedgerTransaction, StockLedger, StockLevel},
};

/// Clamps a stored BIGINT quantity into the domain's u32.
fn to_quantity(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn map_unique_violation(e: sqlx::Error, order: &OrderRecord) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return LedgerError::DuplicateOrder {
            order_id: order.order_id,
            reservation_id: order.reservation_id,
        };
    }
    LedgerError::Database(e)
}

/// PostgreSQL-backed stock ledger.
#[derive(Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
}

impl PostgresStockLedger {
    /// Creates a new PostgreSQL ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_level(row: PgRow) -> Result<StockLevel> {
        Ok(StockLevel {
            tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            quantity_on_hand: to_quantity(row.try_get("quantity_on_hand")?),
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn load_order(&self, row: PgRow) -> Result<OrderRecord> {
        let order_id: Uuid = row.try_get("id")?;
        let address: serde_json::Value = row.try_get("shipping_address")?;

        let lines = sqlx::query(
            r#"
            SELECT product_id, product_name, quantity, unit_price_cents
            FROM order_lines
            WHERE order_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|line| -> Result<OrderLine> {
            Ok(OrderLine {
                product_id: ProductId::new(line.try_get::<String, _>("product_id")?),
                product_name: line.try_get("product_name")?,
                quantity: to_quantity(line.try_get("quantity")?),
                unit_price: Money::from_cents(line.try_get("unit_price_cents")?),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(OrderRecord {
            order_id: OrderId::from_uuid(order_id),
            tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
            lines,
            subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
            shipping: Money::from_cents(row.try_get("shipping_cents")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            total: Money::from_cents(row.try_get("total_cents")?),
            coupon_code: row.try_get("coupon_code")?,
            shipping_address: serde_json::from_value::<ShippingAddress>(address)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A live PostgreSQL transaction.
///
/// Dropping it without calling `commit` rolls it back.
pub struct PostgresLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PostgresLedgerTransaction {
    async fn decrement_stock(
        &mut self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<u32> {
        // Single conditional update: the row lock taken here serialises
        // concurrent commits on the same product.
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE stock_levels
            SET quantity_on_hand = quantity_on_hand - $3, updated_at = NOW()
            WHERE tenant_id = $1 AND product_id = $2 AND quantity_on_hand >= $3
            RETURNING quantity_on_hand
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(product_id.as_str())
        .bind(i64::from(quantity))
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(remaining) = remaining {
            return Ok(to_quantity(remaining));
        }

        let on_hand: Option<i64> = sqlx::query_scalar(
            "SELECT quantity_on_hand FROM stock_levels WHERE tenant_id = $1 AND product_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(product_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        match on_hand {
            Some(on_hand) => Err(LedgerError::InsufficientStock {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
                requested: quantity,
                on_hand: to_quantity(on_hand),
            }),
            None => Err(LedgerError::UnknownProduct {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
            }),
        }
    }

    async fn insert_order(&mut self, order: &OrderRecord) -> Result<()> {
        let address = serde_json::to_value(&order.shipping_address)?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, tenant_id, user_id, reservation_id, subtotal_cents, shipping_cents,
                                discount_cents, total_cents, coupon_code, shipping_address, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(order.order_id.as_uuid())
        .bind(order.tenant_id.as_str())
        .bind(order.user_id.as_str())
        .bind(order.reservation_id.as_uuid())
        .bind(order.subtotal.cents())
        .bind(order.shipping.cents())
        .bind(order.discount.cents())
        .bind(order.total.cents())
        .bind(order.coupon_code.as_deref())
        .bind(address)
        .bind(order.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_unique_violation(e, order))?;

        for (line_no, line) in order.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, line_no, product_id, product_name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.order_id.as_uuid())
            .bind(line_no as i32)
            .bind(line.product_id.as_str())
            .bind(&line.product_name)
            .bind(i64::from(line.quantity))
            .bind(line.unit_price.cents())
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    type Transaction = PostgresLedgerTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(PostgresLedgerTransaction {
            tx: self.pool.begin().await?,
        })
    }

    async fn stock_level(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<StockLevel>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, product_id, quantity_on_hand, updated_at
            FROM stock_levels
            WHERE tenant_id = $1 AND product_id = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_level).transpose()
    }

    async fn set_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<StockLevel> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock_levels (tenant_id, product_id, quantity_on_hand, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id, product_id) DO UPDATE SET
                quantity_on_hand = EXCLUDED.quantity_on_hand,
                updated_at = EXCLUDED.updated_at
            RETURNING tenant_id, product_id, quantity_on_hand, updated_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(product_id.as_str())
        .bind(i64::from(quantity))
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_level(row)
    }

    async fn adjust_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        delta: i64,
    ) -> Result<StockLevel> {
        let row = sqlx::query(
            r#"
            UPDATE stock_levels
            SET quantity_on_hand = quantity_on_hand + $3, updated_at = NOW()
            WHERE tenant_id = $1 AND product_id = $2 AND quantity_on_hand + $3 >= 0
            RETURNING tenant_id, product_id, quantity_on_hand, updated_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(product_id.as_str())
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_level(row);
        }

        match self.stock_level(tenant_id, product_id).await? {
            Some(level) => Err(LedgerError::InsufficientStock {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
                requested: u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX),
                on_hand: level.quantity_on_hand,
            }),
            None => Err(LedgerError::UnknownProduct {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
            }),
        }
    }

    async fn get_order(
        &self,
        tenant_id: &TenantId,
        order_id: OrderId,
    ) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1 AND tenant_id = $2")
            .bind(order_id.as_uuid())
            .bind(tenant_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn order_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE reservation_id = $1")
            .bind(reservation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_order(row).await?)),
            None => Ok(None),
        }
    }
}
