//! Distributed transaction ids.
//!
//! A dtid is `schema:dataSource:transactionId`. The format is shared
//! with every participant and must not change.

use std::fmt::Display;
use std::str::FromStr;

use super::Error;

/// Parsed dtid: the session that started the distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dtid {
    pub schema: String,
    pub data_source: String,
    pub transaction_id: i64,
}

impl Dtid {
    pub fn new(schema: impl ToString, data_source: impl ToString, transaction_id: i64) -> Self {
        Self {
            schema: schema.to_string(),
            data_source: data_source.to_string(),
            transaction_id,
        }
    }
}

impl Display for Dtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.schema, self.data_source, self.transaction_id
        )
    }
}

impl FromStr for Dtid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [schema, data_source, id] = parts.as_slice() else {
            return Err(Error::InvalidParts(s.to_string()));
        };

        let transaction_id = id
            .parse()
            .map_err(|_| Error::InvalidTransactionId(s.to_string()))?;

        Ok(Self::new(schema, data_source, transaction_id))
    }
}
