use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Opaque pagination cursor: base64 of `{"last_event_id":N}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCursor {
    pub last_event_id: u64,
}

impl LedgerCursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| LedgerError::InvalidCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| LedgerError::InvalidCursor)
    }
}
