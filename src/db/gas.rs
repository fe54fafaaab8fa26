use bigdecimal::BigDecimal;
use rusqlite::{Connection, OptionalExtension, named_params};

use super::chain::parse_decimal;
use super::error::DbResult;
use crate::models::AddressId;

/// Most recent `(date, balance)` recorded for an address, if any.
pub fn get_latest_gas_balance(conn: &Connection, address_id: AddressId) -> DbResult<Option<(String, BigDecimal)>> {
    let row: Option<(String, String)> = conn
        .prepare_cached(
            r#"
            SELECT date, balance
            FROM addr_gas_balance
            WHERE address_id = :address_id
            ORDER BY date DESC
            LIMIT 1
            "#,
        )?
        .query_row(named_params! { ":address_id": address_id }, |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;

    row.map(|(date, balance)| Ok((date, parse_decimal(&balance)?)))
        .transpose()
}

pub fn upsert_gas_balance(conn: &Connection, address_id: AddressId, date: &str, balance: &BigDecimal) -> DbResult<()> {
    conn.prepare_cached(
        r#"
        INSERT INTO addr_gas_balance (address_id, date, balance)
        VALUES (:address_id, :date, :balance)
        ON CONFLICT(address_id, date) DO UPDATE SET balance = excluded.balance
        "#,
    )?
    .execute(named_params! {
        ":address_id": address_id,
        ":date": date,
        ":balance": balance.to_string(),
    })?;
    Ok(())
}
