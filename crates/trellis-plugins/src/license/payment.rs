use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PluginResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: f64,
    pub currency: String,
    pub payer_identity: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_id: String,
    pub status: TransactionStatus,
}

/// External payment processor supplied by the host
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn process_payment(&self, request: &PaymentRequest) -> PluginResult<PaymentReceipt>;
}

/// Who pays, plus anything the processor should see
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub payer_identity: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PaymentDetails {
    pub fn new(payer_identity: impl Into<String>) -> Self {
        Self {
            payer_identity: payer_identity.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A payment attempt made for a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub plugin_id: String,
    pub payer_identity: String,
    pub amount: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(plugin_id: &str, request: &PaymentRequest, receipt: &PaymentReceipt) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: receipt.transaction_id.clone(),
            plugin_id: plugin_id.to_string(),
            payer_identity: request.payer_identity.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: receipt.status,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
