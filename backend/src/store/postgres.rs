//! Postgres-backed allocation store
//!
//! Reservation is a single conditional `UPDATE ... WHERE physical_stock -
//! allocated_stock >= $n`, so two writers can never jointly overcommit a
//! variant. Every multi-row change runs inside one transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{
    next_status, AdjustmentReason, Demand, MovementEffect, MovementType, Order, OrderLine,
    OrderStatus, Reference, StockMovement, StockVariant, VariantKey,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{AllocationScope, AllocationStore, Release, Shipment};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};

const ORDER_LINES_SQL: &str = r#"
    SELECT id, order_id, product_id, color, size, quantity,
           allocated_quantity, shipped_quantity, unit_price
    FROM order_items
    WHERE order_id = $1
    ORDER BY id
"#;

/// Allocation store over a Postgres pool
#[derive(Clone)]
pub struct PgAllocationStore {
    db: PgPool,
}

/// Build the connection pool, applying the configured statement timeout
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let statement_timeout_ms = config.statement_timeout_ms;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let sql = format!("SET statement_timeout = {}", statement_timeout_ms);
                sqlx::query(&sql).execute(conn).await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await
}

/// Row for stock variant queries
#[derive(Debug, FromRow)]
struct VariantRow {
    id: Uuid,
    product_id: Uuid,
    color: Option<String>,
    size: Option<String>,
    physical_stock: i32,
    allocated_stock: i32,
    is_blocked: bool,
    blocked_reason: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<VariantRow> for StockVariant {
    fn from(row: VariantRow) -> Self {
        StockVariant {
            id: row.id,
            key: VariantKey {
                product_id: row.product_id,
                color: row.color,
                size: row.size,
            },
            physical_stock: row.physical_stock,
            allocated_stock: row.allocated_stock,
            is_blocked: row.is_blocked,
            blocked_reason: row.blocked_reason,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

/// Row for stock movement queries
#[derive(Debug, FromRow)]
struct MovementRow {
    id: Uuid,
    product_id: Uuid,
    color: Option<String>,
    size: Option<String>,
    quantity_delta: i32,
    movement_type: String,
    affects: String,
    reference_type: Option<String>,
    reference_id: Option<Uuid>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = AppError;

    fn try_from(row: MovementRow) -> AppResult<Self> {
        Ok(StockMovement {
            id: row.id,
            product_id: row.product_id,
            color: row.color,
            size: row.size,
            quantity_delta: row.quantity_delta,
            movement_type: row.movement_type.parse().map_err(corrupt_row)?,
            affects: row.affects.parse().map_err(corrupt_row)?,
            reference_type: row
                .reference_type
                .map(|r| r.parse())
                .transpose()
                .map_err(corrupt_row)?,
            reference_id: row.reference_id,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

/// Row for order queries
#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    customer_id: Uuid,
    user_type: String,
    priority_level: i32,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = AppError;

    fn try_from(row: OrderRow) -> AppResult<Self> {
        Ok(Order {
            id: row.id,
            customer_id: row.customer_id,
            user_type: row.user_type.parse().map_err(corrupt_row)?,
            customer_priority: row.priority_level,
            status: row.status.parse().map_err(corrupt_row)?,
            created_at: row.created_at,
        })
    }
}

/// Row for order line queries
#[derive(Debug, FromRow)]
struct LineRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    color: Option<String>,
    size: Option<String>,
    quantity: i32,
    allocated_quantity: i32,
    shipped_quantity: i32,
    unit_price: Decimal,
}

impl From<LineRow> for OrderLine {
    fn from(row: LineRow) -> Self {
        OrderLine {
            id: row.id,
            order_id: row.order_id,
            key: VariantKey {
                product_id: row.product_id,
                color: row.color,
                size: row.size,
            },
            ordered_quantity: row.quantity,
            allocated_quantity: row.allocated_quantity,
            shipped_quantity: row.shipped_quantity,
            unit_price: row.unit_price,
        }
    }
}

/// Row for the pending demand query
#[derive(Debug, FromRow)]
struct DemandRow {
    order_line_id: Uuid,
    order_id: Uuid,
    order_created_at: DateTime<Utc>,
    customer_priority: i32,
    user_type: String,
    order_total_amount: Decimal,
    needed_quantity: i32,
}

impl TryFrom<DemandRow> for Demand {
    type Error = AppError;

    fn try_from(row: DemandRow) -> AppResult<Self> {
        let user_type: shared::UserType = row.user_type.parse().map_err(corrupt_row)?;
        Ok(Demand {
            order_line_id: row.order_line_id,
            order_id: row.order_id,
            order_created_at: row.order_created_at,
            customer_priority: row.customer_priority,
            user_type_rank: user_type.rank(),
            order_total_amount: row.order_total_amount,
            needed_quantity: row.needed_quantity,
        })
    }
}

/// Row for locking an order line together with its order status
#[derive(Debug, FromRow)]
struct LockedLineRow {
    #[sqlx(flatten)]
    line: LineRow,
    order_status: String,
}

fn corrupt_row(err: shared::ParseEnumError) -> AppError {
    AppError::Internal(format!("Corrupt row: {}", err))
}

impl PgAllocationStore {
    /// Create a new PgAllocationStore instance
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn lock_variant(
        tx: &mut Transaction<'_, Postgres>,
        key: &VariantKey,
    ) -> AppResult<Option<VariantRow>> {
        let row = sqlx::query_as::<_, VariantRow>(
            r#"
            SELECT id, product_id, color, size, physical_stock, allocated_stock,
                   is_blocked, blocked_reason, version, updated_at
            FROM product_variants
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
            FOR UPDATE
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    /// Lock a line together with its order row, so status changes on the
    /// order wait for the line update to commit
    async fn lock_line(
        tx: &mut Transaction<'_, Postgres>,
        order_line_id: Uuid,
    ) -> AppResult<(OrderLine, OrderStatus)> {
        let row = sqlx::query_as::<_, LockedLineRow>(
            r#"
            SELECT i.id, i.order_id, i.product_id, i.color, i.size, i.quantity,
                   i.allocated_quantity, i.shipped_quantity, i.unit_price,
                   o.status AS order_status
            FROM order_items i
            JOIN orders o ON o.id = i.order_id
            WHERE i.id = $1
            FOR UPDATE OF i, o
            "#,
        )
        .bind(order_line_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Order line".to_string()))?;

        let status: OrderStatus = row.order_status.parse().map_err(corrupt_row)?;
        Ok((row.line.into(), status))
    }

    async fn insert_movement(
        tx: &mut Transaction<'_, Postgres>,
        key: &VariantKey,
        delta: i32,
        movement_type: MovementType,
        affects: MovementEffect,
        reference: Option<Reference>,
        notes: Option<&str>,
    ) -> AppResult<StockMovement> {
        let row = sqlx::query_as::<_, MovementRow>(
            r#"
            INSERT INTO stock_movements (
                product_id, color, size, quantity_delta, movement_type, affects,
                reference_type, reference_id, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, product_id, color, size, quantity_delta, movement_type, affects,
                      reference_type, reference_id, notes, created_at
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .bind(delta)
        .bind(movement_type.as_str())
        .bind(affects.as_str())
        .bind(reference.map(|r| r.reference_type.as_str()))
        .bind(reference.map(|r| r.reference_id))
        .bind(notes)
        .fetch_one(&mut **tx)
        .await?;

        row.try_into()
    }

    /// Conditional reservation; explains a refused update afterwards
    async fn reserve_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        key: &VariantKey,
        quantity: i32,
    ) -> AppResult<()> {
        let reserved = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE product_variants
            SET allocated_stock = allocated_stock + $4, version = version + 1, updated_at = NOW()
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
              AND NOT is_blocked
              AND physical_stock - allocated_stock >= $4
            RETURNING id
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .bind(quantity)
        .fetch_optional(&mut **tx)
        .await?;

        if reserved.is_some() {
            return Ok(());
        }

        match Self::lock_variant(tx, key).await? {
            Some(row) if row.is_blocked => Err(AppError::LedgerInconsistency {
                variant: key.to_string(),
                reason: row
                    .blocked_reason
                    .unwrap_or_else(|| "variant is blocked".to_string()),
            }),
            Some(row) => Err(AppError::InsufficientAvailableStock {
                variant: key.to_string(),
                available: (row.physical_stock - row.allocated_stock).max(0),
                requested: quantity,
            }),
            None => Err(AppError::InsufficientAvailableStock {
                variant: key.to_string(),
                available: 0,
                requested: quantity,
            }),
        }
    }

    /// Lowers allocated stock by at most `quantity`; returns the amount released
    async fn release_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        key: &VariantKey,
        quantity: i32,
    ) -> AppResult<i32> {
        let row = match Self::lock_variant(tx, key).await? {
            Some(row) => row,
            None => return Ok(0),
        };
        let released = quantity.min(row.allocated_stock).max(0);
        if released > 0 {
            sqlx::query(
                r#"
                UPDATE product_variants
                SET allocated_stock = allocated_stock - $2, version = version + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row.id)
            .bind(released)
            .execute(&mut **tx)
            .await?;
        }
        Ok(released)
    }
}

#[async_trait]
impl AllocationStore for PgAllocationStore {
    async fn get_variant(&self, key: &VariantKey) -> AppResult<Option<StockVariant>> {
        let row = sqlx::query_as::<_, VariantRow>(
            r#"
            SELECT id, product_id, color, size, physical_stock, allocated_stock,
                   is_blocked, blocked_reason, version, updated_at
            FROM product_variants
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_variants(&self, product_id: Uuid) -> AppResult<Vec<StockVariant>> {
        let rows = sqlx::query_as::<_, VariantRow>(
            r#"
            SELECT id, product_id, color, size, physical_stock, allocated_stock,
                   is_blocked, blocked_reason, version, updated_at
            FROM product_variants
            WHERE product_id = $1
            ORDER BY color NULLS FIRST, size NULLS FIRST
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn define_variant(
        &self,
        key: &VariantKey,
        initial_stock: i32,
    ) -> AppResult<StockVariant> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query_as::<_, VariantRow>(
            r#"
            INSERT INTO product_variants (product_id, color, size, physical_stock)
            VALUES ($1, $2, $3, $4)
            RETURNING id, product_id, color, size, physical_stock, allocated_stock,
                      is_blocked, blocked_reason, version, updated_at
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .bind(initial_stock)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict {
                resource: "stock_variant".to_string(),
                message: format!("Stock variant {} already exists", key),
                message_ko: format!("이미 등록된 옵션입니다: {}", key),
            },
            _ => AppError::from(e),
        })?;

        if initial_stock > 0 {
            Self::insert_movement(
                &mut tx,
                key,
                initial_stock,
                MovementType::InitialStock,
                MovementEffect::Physical,
                None,
                Some("initial stock"),
            )
            .await?;
        }

        tx.commit().await?;

        Ok(row.into())
    }

    async fn adjust_physical(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockMovement> {
        let mut tx = self.db.begin().await?;

        match Self::lock_variant(&mut tx, key).await? {
            Some(row) => {
                let new_physical = row.physical_stock + delta;
                if new_physical < 0 || new_physical < row.allocated_stock {
                    return Err(AppError::InsufficientPhysicalStock {
                        variant: key.to_string(),
                        physical: row.physical_stock,
                        allocated: row.allocated_stock,
                        delta,
                    });
                }
                sqlx::query(
                    r#"
                    UPDATE product_variants
                    SET physical_stock = $2, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .bind(new_physical)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                if delta < 0 {
                    return Err(AppError::InsufficientPhysicalStock {
                        variant: key.to_string(),
                        physical: 0,
                        allocated: 0,
                        delta,
                    });
                }
                sqlx::query(
                    r#"
                    INSERT INTO product_variants (product_id, color, size, physical_stock)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(key.product_id)
                .bind(&key.color)
                .bind(&key.size)
                .bind(delta)
                .execute(&mut *tx)
                .await
                .map_err(|e| match &e {
                    sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                        AppError::ConcurrentModification(format!(
                            "stock variant {} was created concurrently",
                            key
                        ))
                    }
                    _ => AppError::from(e),
                })?;
            }
        }

        let movement = Self::insert_movement(
            &mut tx,
            key,
            delta,
            reason.movement_type,
            MovementEffect::Physical,
            reason.reference,
            reason.notes.as_deref(),
        )
        .await?;

        tx.commit().await?;

        Ok(movement)
    }

    async fn reserve(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<StockMovement> {
        let mut tx = self.db.begin().await?;

        Self::reserve_in_tx(&mut tx, key, quantity).await?;
        let movement = Self::insert_movement(
            &mut tx,
            key,
            -quantity,
            MovementType::OrderAllocation,
            MovementEffect::Allocated,
            reference,
            None,
        )
        .await?;

        tx.commit().await?;

        Ok(movement)
    }

    async fn release(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Release> {
        let mut tx = self.db.begin().await?;

        let released = Self::release_in_tx(&mut tx, key, quantity).await?;
        let movement = if released > 0 {
            Some(
                Self::insert_movement(
                    &mut tx,
                    key,
                    released,
                    MovementType::OrderAllocation,
                    MovementEffect::Allocated,
                    reference,
                    Some("release"),
                )
                .await?,
            )
        } else {
            None
        };

        tx.commit().await?;

        Ok(Release {
            requested: quantity,
            released,
            movement,
        })
    }

    async fn correct_allocated(
        &self,
        key: &VariantKey,
        expected: i32,
        notes: &str,
    ) -> AppResult<Option<StockMovement>> {
        let mut tx = self.db.begin().await?;

        let row = Self::lock_variant(&mut tx, key)
            .await?
            .ok_or_else(|| AppError::NotFound("Stock variant".to_string()))?;

        sqlx::query(
            r#"
            UPDATE product_variants
            SET allocated_stock = $2, is_blocked = FALSE, blocked_reason = NULL,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        let movement = if row.allocated_stock != expected {
            Some(
                Self::insert_movement(
                    &mut tx,
                    key,
                    row.allocated_stock - expected,
                    MovementType::OrderAllocation,
                    MovementEffect::Allocated,
                    None,
                    Some(notes),
                )
                .await?,
            )
        } else {
            None
        };

        tx.commit().await?;

        Ok(movement)
    }

    async fn set_blocked(&self, key: &VariantKey, reason: Option<String>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE product_variants
            SET is_blocked = $4, blocked_reason = $5, version = version + 1, updated_at = NOW()
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .bind(reason.is_some())
        .bind(&reason)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn outstanding_reservations(&self, key: &VariantKey) -> AppResult<i32> {
        let total = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(SUM(allocated_quantity - shipped_quantity), 0)::INTEGER
            FROM order_items
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .fetch_one(&self.db)
        .await?;

        Ok(total)
    }

    async fn allocate_line(&self, order_line_id: Uuid, quantity: i32) -> AppResult<StockMovement> {
        let mut tx = self.db.begin().await?;

        let updated = sqlx::query_as::<_, (Uuid, Uuid, Option<String>, Option<String>)>(
            r#"
            UPDATE order_items i
            SET allocated_quantity = i.allocated_quantity + $2
            FROM orders o
            WHERE i.id = $1
              AND o.id = i.order_id
              AND o.status NOT IN ('shipped', 'cancelled')
              AND i.allocated_quantity + $2 <= i.quantity
            RETURNING i.order_id, i.product_id, i.color, i.size
            "#,
        )
        .bind(order_line_id)
        .bind(quantity)
        .fetch_optional(&mut *tx)
        .await?;

        let (order_id, product_id, color, size) = match updated {
            Some(row) => row,
            None => {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM order_items WHERE id = $1)",
                )
                .bind(order_line_id)
                .fetch_one(&mut *tx)
                .await?;
                if !exists {
                    return Err(AppError::NotFound("Order line".to_string()));
                }
                return Err(AppError::InvalidStateTransition(format!(
                    "order line {} cannot take {} more units",
                    order_line_id, quantity
                )));
            }
        };

        let key = VariantKey {
            product_id,
            color,
            size,
        };
        Self::reserve_in_tx(&mut tx, &key, quantity).await?;
        let notes = format!("allocated to line {}", order_line_id);
        let movement = Self::insert_movement(
            &mut tx,
            &key,
            -quantity,
            MovementType::OrderAllocation,
            MovementEffect::Allocated,
            Some(Reference::order(order_id)),
            Some(&notes),
        )
        .await?;

        tx.commit().await?;

        Ok(movement)
    }

    async fn release_line(&self, order_line_id: Uuid, notes: &str) -> AppResult<Option<Release>> {
        let mut tx = self.db.begin().await?;

        let (line, _) = Self::lock_line(&mut tx, order_line_id).await?;
        let outstanding = line.outstanding_reservation();
        if outstanding == 0 {
            return Ok(None);
        }

        sqlx::query("UPDATE order_items SET allocated_quantity = shipped_quantity WHERE id = $1")
            .bind(order_line_id)
            .execute(&mut *tx)
            .await?;

        let released = Self::release_in_tx(&mut tx, &line.key, outstanding).await?;
        let movement = if released > 0 {
            Some(
                Self::insert_movement(
                    &mut tx,
                    &line.key,
                    released,
                    MovementType::OrderAllocation,
                    MovementEffect::Allocated,
                    Some(Reference::order(line.order_id)),
                    Some(notes),
                )
                .await?,
            )
        } else {
            None
        };

        tx.commit().await?;

        Ok(Some(Release {
            requested: outstanding,
            released,
            movement,
        }))
    }

    async fn ship_line(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Shipment> {
        let mut tx = self.db.begin().await?;

        let (line, status) = Self::lock_line(&mut tx, order_line_id).await?;
        if status.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "order {} is {}",
                line.order_id, status
            )));
        }
        if quantity > line.outstanding_reservation() {
            return Err(AppError::InvalidStateTransition(format!(
                "order line {} has only {} reserved units to ship",
                line.id,
                line.outstanding_reservation()
            )));
        }

        let variant = Self::lock_variant(&mut tx, &line.key)
            .await?
            .ok_or_else(|| AppError::LedgerInconsistency {
                variant: line.key.to_string(),
                reason: "reserved line has no stock variant".to_string(),
            })?;
        if variant.allocated_stock < quantity || variant.physical_stock < quantity {
            return Err(AppError::LedgerInconsistency {
                variant: line.key.to_string(),
                reason: format!(
                    "cannot ship {} units: physical {}, allocated {}",
                    quantity, variant.physical_stock, variant.allocated_stock
                ),
            });
        }

        sqlx::query(
            r#"
            UPDATE product_variants
            SET physical_stock = physical_stock - $2, allocated_stock = allocated_stock - $2,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(variant.id)
        .bind(quantity)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE order_items SET shipped_quantity = shipped_quantity + $2 WHERE id = $1")
            .bind(order_line_id)
            .bind(quantity)
            .execute(&mut *tx)
            .await?;

        let notes = format!("shipped from line {}", order_line_id);
        let movement = Self::insert_movement(
            &mut tx,
            &line.key,
            -quantity,
            MovementType::OrderShipment,
            MovementEffect::Both,
            reference.or(Some(Reference::order(line.order_id))),
            Some(&notes),
        )
        .await?;

        let order_completed = sqlx::query_scalar::<_, bool>(
            "SELECT NOT EXISTS(SELECT 1 FROM order_items WHERE order_id = $1 AND shipped_quantity < quantity)",
        )
        .bind(line.order_id)
        .fetch_one(&mut *tx)
        .await?;

        if order_completed {
            sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(line.order_id)
                .bind(OrderStatus::Shipped.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(Shipment {
            order_line_id,
            order_id: line.order_id,
            shipped_quantity: quantity,
            movement,
            order_completed,
        })
    }

    async fn pending_demands(
        &self,
        key: &VariantKey,
        scope: &AllocationScope,
    ) -> AppResult<Vec<Demand>> {
        let (from, to) = scope.window();
        let rows = sqlx::query_as::<_, DemandRow>(
            r#"
            SELECT i.id AS order_line_id, i.order_id, o.created_at AS order_created_at,
                   c.priority_level AS customer_priority, c.user_type,
                   (SELECT COALESCE(SUM(x.quantity * x.unit_price), 0)
                    FROM order_items x WHERE x.order_id = o.id) AS order_total_amount,
                   i.quantity - i.allocated_quantity AS needed_quantity
            FROM order_items i
            JOIN orders o ON o.id = i.order_id
            JOIN customers c ON c.id = o.customer_id
            WHERE i.product_id = $1 AND i.color IS NOT DISTINCT FROM $2 AND i.size IS NOT DISTINCT FROM $3
              AND i.allocated_quantity < i.quantity
              AND o.status NOT IN ('shipped', 'cancelled')
              AND ($4::uuid IS NULL OR i.product_id = $4)
              AND ($5::timestamptz IS NULL OR o.created_at >= $5)
              AND ($6::timestamptz IS NULL OR o.created_at < $6)
            ORDER BY o.created_at ASC, i.order_id ASC, i.id ASC
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .bind(scope.product_id())
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Demand::try_from).collect()
    }

    async fn lines_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<OrderLine>> {
        let (from, to) = scope.window();
        let rows = sqlx::query_as::<_, LineRow>(
            r#"
            SELECT i.id, i.order_id, i.product_id, i.color, i.size, i.quantity,
                   i.allocated_quantity, i.shipped_quantity, i.unit_price
            FROM order_items i
            JOIN orders o ON o.id = i.order_id
            WHERE o.status NOT IN ('shipped', 'cancelled')
              AND ($1::uuid IS NULL OR i.product_id = $1)
              AND ($2::timestamptz IS NULL OR o.created_at >= $2)
              AND ($3::timestamptz IS NULL OR o.created_at < $3)
            ORDER BY o.created_at ASC, i.order_id ASC, i.id ASC
            "#,
        )
        .bind(scope.product_id())
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_line(&self, order_line_id: Uuid) -> AppResult<Option<OrderLine>> {
        let row = sqlx::query_as::<_, LineRow>(
            r#"
            SELECT id, order_id, product_id, color, size, quantity,
                   allocated_quantity, shipped_quantity, unit_price
            FROM order_items
            WHERE id = $1
            "#,
        )
        .bind(order_line_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT o.id, o.customer_id, c.user_type, c.priority_level, o.status, o.created_at
            FROM orders o
            JOIN customers c ON c.id = o.customer_id
            WHERE o.id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>> {
        let rows = sqlx::query_as::<_, LineRow>(ORDER_LINES_SQL)
            .bind(order_id)
            .fetch_all(&self.db)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn orders_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<Order>> {
        let (from, to) = scope.window();
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT o.id, o.customer_id, c.user_type, c.priority_level, o.status, o.created_at
            FROM orders o
            JOIN customers c ON c.id = o.customer_id
            WHERE o.status NOT IN ('shipped', 'cancelled')
              AND EXISTS (
                  SELECT 1 FROM order_items i
                  WHERE i.order_id = o.id AND ($1::uuid IS NULL OR i.product_id = $1)
              )
              AND ($2::timestamptz IS NULL OR o.created_at >= $2)
              AND ($3::timestamptz IS NULL OR o.created_at < $3)
            ORDER BY o.created_at ASC, o.id ASC
            "#,
        )
        .bind(scope.product_id())
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn set_order_status(&self, order_id: Uuid, status: OrderStatus) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status <> $2 AND status NOT IN ('shipped', 'cancelled')
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let current: OrderStatus =
            sqlx::query_scalar::<_, String>("SELECT status FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| AppError::NotFound("Order".to_string()))?
                .parse()
                .map_err(corrupt_row)?;

        if current == status {
            Ok(false)
        } else {
            Err(AppError::InvalidStateTransition(format!(
                "order {} is already {}",
                order_id, current
            )))
        }
    }

    async fn project_order(&self, order_id: Uuid) -> AppResult<(OrderStatus, OrderStatus)> {
        let mut tx = self.db.begin().await?;

        let previous: OrderStatus =
            sqlx::query_scalar::<_, String>("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound("Order".to_string()))?
                .parse()
                .map_err(corrupt_row)?;
        if previous.is_terminal() {
            tx.commit().await?;
            return Ok((previous, previous));
        }

        let lines: Vec<OrderLine> = sqlx::query_as::<_, LineRow>(ORDER_LINES_SQL)
            .bind(order_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        let projected = next_status(previous, &lines);

        if projected != previous {
            sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(order_id)
                .bind(projected.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok((previous, projected))
    }

    async fn movements(&self, key: &VariantKey) -> AppResult<Vec<StockMovement>> {
        let rows = sqlx::query_as::<_, MovementRow>(
            r#"
            SELECT id, product_id, color, size, quantity_delta, movement_type, affects,
                   reference_type, reference_id, notes, created_at
            FROM stock_movements
            WHERE product_id = $1 AND color IS NOT DISTINCT FROM $2 AND size IS NOT DISTINCT FROM $3
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(key.product_id)
        .bind(&key.color)
        .bind(&key.size)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(StockMovement::try_from).collect()
    }

    async fn product_movements(&self, product_id: Uuid) -> AppResult<Vec<StockMovement>> {
        let rows = sqlx::query_as::<_, MovementRow>(
            r#"
            SELECT id, product_id, color, size, quantity_delta, movement_type, affects,
                   reference_type, reference_id, notes, created_at
            FROM stock_movements
            WHERE product_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(StockMovement::try_from).collect()
    }
}
