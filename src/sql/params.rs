//! Bind values for PostgreSQL and MySQL.
//!
//! Each value reports its own wire type through `produces()`, so an integer is sent as
//! INT8 and a string as TEXT; the statement text casts it to the column's type.

use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::mysql::{MySql, MySqlTypeInfo};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::{Database, Type};

type BoxDynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl BindValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BindValue::Null)
    }

    /// Value as it would be echoed back in a response.
    pub fn to_json(&self) -> Value {
        use base64::Engine;
        match self {
            BindValue::Null => Value::Null,
            BindValue::Bool(b) => Value::Bool(*b),
            BindValue::I64(n) => Value::Number((*n).into()),
            BindValue::F64(n) => serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
            BindValue::Text(s) => Value::String(s.clone()),
            BindValue::Bytes(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
            BindValue::Json(v) => v.clone(),
        }
    }
}

impl<'q> Encode<'q, Postgres> for BindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        Ok(match self {
            BindValue::Null => <Option<&str> as Encode<Postgres>>::encode_by_ref(&None, buf)?,
            BindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            BindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            BindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            BindValue::Text(s) => <&str as Encode<Postgres>>::encode_by_ref(&s.as_str(), buf)?,
            BindValue::Bytes(b) => <&[u8] as Encode<Postgres>>::encode_by_ref(&b.as_slice(), buf)?,
            BindValue::Json(v) => <Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(match self {
            BindValue::Null | BindValue::Text(_) => <&str as Type<Postgres>>::type_info(),
            BindValue::Bool(_) => <bool as Type<Postgres>>::type_info(),
            BindValue::I64(_) => <i64 as Type<Postgres>>::type_info(),
            BindValue::F64(_) => <f64 as Type<Postgres>>::type_info(),
            BindValue::Bytes(_) => <&[u8] as Type<Postgres>>::type_info(),
            BindValue::Json(_) => <Value as Type<Postgres>>::type_info(),
        })
    }
}

impl Type<Postgres> for BindValue {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }
}

impl<'q> Encode<'q, MySql> for BindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <MySql as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        Ok(match self {
            BindValue::Null => <Option<&str> as Encode<MySql>>::encode_by_ref(&None, buf)?,
            BindValue::Bool(b) => <bool as Encode<MySql>>::encode_by_ref(b, buf)?,
            BindValue::I64(n) => <i64 as Encode<MySql>>::encode_by_ref(n, buf)?,
            BindValue::F64(n) => <f64 as Encode<MySql>>::encode_by_ref(n, buf)?,
            BindValue::Text(s) => <&str as Encode<MySql>>::encode_by_ref(&s.as_str(), buf)?,
            BindValue::Bytes(b) => <&[u8] as Encode<MySql>>::encode_by_ref(&b.as_slice(), buf)?,
            BindValue::Json(v) => <Value as Encode<MySql>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<MySqlTypeInfo> {
        Some(match self {
            BindValue::Null | BindValue::Text(_) => <&str as Type<MySql>>::type_info(),
            BindValue::Bool(_) => <bool as Type<MySql>>::type_info(),
            BindValue::I64(_) => <i64 as Type<MySql>>::type_info(),
            BindValue::F64(_) => <f64 as Type<MySql>>::type_info(),
            BindValue::Bytes(_) => <&[u8] as Type<MySql>>::type_info(),
            BindValue::Json(_) => <Value as Type<MySql>>::type_info(),
        })
    }
}

impl Type<MySql> for BindValue {
    fn type_info() -> MySqlTypeInfo {
        <&str as Type<MySql>>::type_info()
    }
}
