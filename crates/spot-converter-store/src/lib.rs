//! DynamoDB-backed job record store
//!
//! One item per conversion job: partition key `instance_id`, attribute
//! `record` holding the JSON-serialised record. Reads are strongly
//! consistent so a load right after a save observes the just-written
//! value; nothing here requires transactions or indexes.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use spot_converter_core::error::{ConvertError, Result};
use spot_converter_core::record::JobRecord;
use spot_converter_core::store::{persistence_error, EnsureTable, RecordStore};
use tracing::{debug, info};

const KEY_ATTRIBUTE: &str = "instance_id";
const RECORD_ATTRIBUTE: &str = "record";

/// `RecordStore` over a single DynamoDB table
pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoStore {
    pub fn new(config: &SdkConfig, table_name: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_dynamodb::Client::new(config),
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[async_trait]
impl RecordStore for DynamoStore {
    async fn ensure_table(&self) -> Result<EnsureTable> {
        let key_schema = KeySchemaElement::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| persistence_error("key schema", e))?;
        let attribute = AttributeDefinition::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| persistence_error("attribute definition", e))?;

        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .key_schema(key_schema)
            .attribute_definitions(attribute)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table_name, "created state table");
                Ok(EnsureTable::Created)
            }
            Err(e) if e.code() == Some("ResourceInUseException") => {
                debug!(table = %self.table_name, "state table already exists");
                Ok(EnsureTable::AlreadyExists)
            }
            Err(e) => Err(persistence_error(
                &format!("creating table '{}'", self.table_name),
                aws_sdk_dynamodb::error::DisplayErrorContext(e),
            )),
        }
    }

    async fn load(&self, instance_id: &str) -> Result<Option<JobRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(instance_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                persistence_error(
                    &format!("loading record '{instance_id}'"),
                    aws_sdk_dynamodb::error::DisplayErrorContext(e),
                )
            })?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let raw = item
            .get(RECORD_ATTRIBUTE)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| {
                ConvertError::Persistence(format!(
                    "record '{instance_id}' has no '{RECORD_ATTRIBUTE}' attribute"
                ))
            })?;
        let record = serde_json::from_str(raw).map_err(|e| {
            ConvertError::Persistence(format!("record '{instance_id}' is not parseable: {e}"))
        })?;
        Ok(Some(record))
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| ConvertError::Persistence(format!("serialising record: {e}")))?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(
                KEY_ATTRIBUTE,
                AttributeValue::S(record.instance_id.clone()),
            )
            .item(RECORD_ATTRIBUTE, AttributeValue::S(raw))
            .send()
            .await
            .map_err(|e| {
                persistence_error(
                    &format!("saving record '{}'", record.instance_id),
                    aws_sdk_dynamodb::error::DisplayErrorContext(e),
                )
            })?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(instance_id.to_string()))
            .send()
            .await
            .map_err(|e| {
                persistence_error(
                    &format!("deleting record '{instance_id}'"),
                    aws_sdk_dynamodb::error::DisplayErrorContext(e),
                )
            })?;
        Ok(())
    }
}
