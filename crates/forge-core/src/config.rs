//! Shared configuration primitives. Individual layers (reliability, worker, scheduler,
//! health) define their own `serde`-deserializable config structs following this same
//! default-then-builder shape.

use serde::{Deserialize, Serialize};

/// How long the ledger and DLQ keep terminal rows around before a maintenance sweep may
/// delete them. Not itself a deletion policy — just the shared knob every cleanup job reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}
