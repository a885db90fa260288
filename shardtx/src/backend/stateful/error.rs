use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("transaction {id}: {reason}")]
    Lookup { id: i64, reason: String },

    #[error("connection {0} is not reserved, can't renew it")]
    NotTainted(i64),

    #[error("connection pool is closed")]
    Closed,

    #[error("{0}")]
    Backend(#[from] crate::backend::Error),
}

impl Error {
    pub(crate) fn lookup(id: i64, reason: impl ToString) -> Self {
        Self::Lookup {
            id,
            reason: reason.to_string(),
        }
    }
}
