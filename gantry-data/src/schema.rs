//! Arrow schemas for the analytical tables.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;

use crate::{AnalyticsError, AnalyticsResult};

/// Canonical decimal layout for every monetary column.
pub const DECIMAL_PRECISION: u8 = 28;
pub const DECIMAL_SCALE: i8 = 6;
pub const DECIMAL_SCALE_U32: u32 = 6;

pub fn decimal_type() -> DataType {
    DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE)
}

pub fn bars_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("ts", DataType::Int64, false),
        Field::new("open", decimal_type(), false),
        Field::new("high", decimal_type(), false),
        Field::new("low", decimal_type(), false),
        Field::new("close", decimal_type(), false),
        Field::new("volume", decimal_type(), false),
        Field::new("tier", DataType::Utf8, false),
    ]))
}

pub fn orders_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Utf8, false),
        Field::new("client_order_id", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        Field::new("qty", decimal_type(), false),
        Field::new("order_type", DataType::Utf8, false),
        Field::new("limit_price", decimal_type(), true),
        Field::new("final_state", DataType::Utf8, false),
        Field::new("created_at", DataType::Int64, false),
        Field::new("terminal_at", DataType::Int64, true),
    ]))
}

pub fn fills_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("fill_id", DataType::Utf8, false),
        Field::new("order_id", DataType::Utf8, false),
        Field::new("qty", decimal_type(), false),
        Field::new("price", decimal_type(), false),
        Field::new("fees", decimal_type(), false),
        Field::new("ts", DataType::Int64, false),
    ]))
}

pub fn positions_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("net_qty", decimal_type(), false),
        Field::new("avg_cost", decimal_type(), false),
        Field::new("unrealized_pnl", decimal_type(), false),
    ]))
}

pub fn performance_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("equity", decimal_type(), false),
        Field::new("cash", decimal_type(), false),
        Field::new("positions_value", decimal_type(), false),
    ]))
}

/// Scale a decimal into the canonical Decimal128 mantissa.
pub fn decimal_to_i128(value: Decimal) -> AnalyticsResult<i128> {
    let mut normalized = value;
    if normalized.scale() > DECIMAL_SCALE_U32 {
        normalized = normalized
            .round_dp_with_strategy(DECIMAL_SCALE_U32, RoundingStrategy::MidpointNearestEven);
    }
    let diff = DECIMAL_SCALE_U32 - normalized.scale();
    let factor = 10i128
        .checked_pow(diff)
        .ok_or_else(|| AnalyticsError::Encode("decimal scaling factor overflow".into()))?;
    normalized
        .mantissa()
        .checked_mul(factor)
        .ok_or_else(|| AnalyticsError::Encode(format!("decimal mantissa overflow for {value}")))
}

/// Inverse of [`decimal_to_i128`].
#[must_use]
pub fn decimal_from_i128(mantissa: i128) -> Decimal {
    Decimal::from_i128_with_scale(mantissa, DECIMAL_SCALE_U32)
}
