//! DynamoDB backend: one table holds many mosaics keyed by
//! `(mosaic, quadkey)`, with the document header stored under the reserved
//! quadkey `"-1"`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, DeleteRequest, KeySchemaElement, KeyType,
    PutRequest, ScalarAttributeType, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use geojson::Feature;
use log::debug;
use serde_json::{Map, Number, Value};
use url::Url;

use crate::backend::{
    apply_update_metadata, compute_update_partial, merge_assets, MosaicBackend,
};
use crate::cache::{self, CacheKey};
use crate::create::UpdateOptions;
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "DynamoDB";

/// Reserved sort key of the item carrying the document header.
const METADATA_QUADKEY: &str = "-1";
/// DynamoDB caps batch writes at 25 items.
const BATCH_SIZE: usize = 25;

#[derive(Clone, Debug)]
pub struct DynamoDbBackend {
    uri: String,
    table: String,
    mosaic_name: String,
    client: Client,
    mosaic: MosaicJSON,
}

fn backend_error(reason: impl ToString) -> MosaicError {
    MosaicError::Backend {
        backend: BACKEND_NAME,
        reason: reason.to_string(),
    }
}

/// `(region, table, mosaic)` parts of `dynamodb://[region]/table:mosaic`.
fn parse_dynamodb_uri(uri: &str) -> MosaicResult<(Option<String>, String, String)> {
    let invalid = || MosaicError::InvalidPath {
        kind: BACKEND_NAME,
        path: uri.to_string(),
    };
    let url = Url::parse(uri).map_err(|_| invalid())?;
    let region = url.host_str().map(ToString::to_string);
    let path = url.path().trim_start_matches('/');
    let (table, mosaic) = path.split_once(':').ok_or_else(invalid)?;
    if table.is_empty() || mosaic.is_empty() {
        return Err(invalid());
    }
    Ok((region, table.to_string(), mosaic.to_string()))
}

impl DynamoDbBackend {
    pub async fn open(uri: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let (region, table, mosaic_name) = parse_dynamodb_uri(uri)?;
        let region = region
            .or_else(|| std::env::var("AWS_REGION").ok())
            .map(Region::new);
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(region);
        }
        let client = Client::new(&loader.load().await);

        let mut backend = Self {
            uri: uri.to_string(),
            table,
            mosaic_name,
            client,
            mosaic: MosaicJSON::default(),
        };
        backend.mosaic = match mosaic_def {
            Some(mosaic) => {
                mosaic.validate()?;
                mosaic
            }
            None => backend.read_document().await?,
        };
        Ok(backend)
    }

    async fn read_document(&self) -> MosaicResult<MosaicJSON> {
        let key = CacheKey::new(BACKEND_NAME, self.uri.as_str());
        if let Some(cached) = cache::get(&key) {
            return Ok((*cached).clone());
        }

        debug!("fetching mosaic header for {}", self.uri);
        let item = self
            .fetch_item(METADATA_QUADKEY)
            .await?
            .ok_or_else(|| MosaicError::MosaicNotFound(self.uri.clone()))?;

        let mut header = Map::new();
        for (name, attr) in item {
            if name == "mosaic" || name == "quadkey" {
                continue;
            }
            header.insert(name, attr_to_value(&attr));
        }
        let mosaic: MosaicJSON = serde_json::from_value(Value::Object(header))?;
        mosaic.validate()?;
        cache::insert(key, std::sync::Arc::new(mosaic.clone()));
        Ok(mosaic)
    }

    async fn fetch_item(
        &self,
        quadkey: &str,
    ) -> MosaicResult<Option<HashMap<String, AttributeValue>>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("mosaic", AttributeValue::S(self.mosaic_name.clone()))
            .key("quadkey", AttributeValue::S(quadkey.to_string()))
            .send()
            .await
            .map_err(backend_error)?;
        Ok(output.item)
    }

    async fn mosaic_exists(&self) -> MosaicResult<bool> {
        Ok(self.fetch_item(METADATA_QUADKEY).await?.is_some())
    }

    async fn ensure_table(&self) -> MosaicResult<()> {
        if self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        debug!("creating DynamoDB table {}", self.table);
        self.client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("mosaic")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(backend_error)?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("quadkey")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(backend_error)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("mosaic")
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(backend_error)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("quadkey")
                    .key_type(KeyType::Range)
                    .build()
                    .map_err(backend_error)?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(backend_error)?;

        // the table is unusable until it leaves CREATING
        for _ in 0..30 {
            let status = self
                .client
                .describe_table()
                .table_name(&self.table)
                .send()
                .await
                .ok()
                .and_then(|out| out.table)
                .and_then(|table| table.table_status);
            if status == Some(aws_sdk_dynamodb::types::TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(backend_error(format!(
            "table {} did not become active",
            self.table
        )))
    }

    fn metadata_item(&self) -> MosaicResult<HashMap<String, AttributeValue>> {
        let mut value = serde_json::to_value(&self.mosaic)?;
        let Value::Object(header) = &mut value else {
            return Err(backend_error("document did not serialize to an object"));
        };
        header.remove("tiles");

        let mut item = HashMap::new();
        item.insert(
            "mosaic".to_string(),
            AttributeValue::S(self.mosaic_name.clone()),
        );
        item.insert(
            "quadkey".to_string(),
            AttributeValue::S(METADATA_QUADKEY.to_string()),
        );
        for (name, val) in header {
            item.insert(name.clone(), value_to_attr(val));
        }
        Ok(item)
    }

    fn tile_item(&self, quadkey: &str, assets: &[String]) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                "mosaic".to_string(),
                AttributeValue::S(self.mosaic_name.clone()),
            ),
            ("quadkey".to_string(), AttributeValue::S(quadkey.to_string())),
            (
                "assets".to_string(),
                AttributeValue::L(
                    assets
                        .iter()
                        .map(|a| AttributeValue::S(a.clone()))
                        .collect(),
                ),
            ),
        ])
    }

    async fn write_items(&self, items: Vec<HashMap<String, AttributeValue>>) -> MosaicResult<()> {
        for chunk in items.chunks(BATCH_SIZE) {
            let requests = chunk
                .iter()
                .map(|item| {
                    PutRequest::builder()
                        .set_item(Some(item.clone()))
                        .build()
                        .map(|put| WriteRequest::builder().put_request(put).build())
                        .map_err(backend_error)
                })
                .collect::<MosaicResult<Vec<_>>>()?;
            self.client
                .batch_write_item()
                .request_items(&self.table, requests)
                .send()
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    /// Remove every item of this mosaic from the table.
    pub async fn delete(&self) -> MosaicResult<()> {
        let mut quadkeys = self.quadkeys().await?;
        quadkeys.push(METADATA_QUADKEY.to_string());
        for chunk in quadkeys.chunks(BATCH_SIZE) {
            let requests = chunk
                .iter()
                .map(|qk| {
                    DeleteRequest::builder()
                        .key("mosaic", AttributeValue::S(self.mosaic_name.clone()))
                        .key("quadkey", AttributeValue::S(qk.clone()))
                        .build()
                        .map(|del| WriteRequest::builder().delete_request(del).build())
                        .map_err(backend_error)
                })
                .collect::<MosaicResult<Vec<_>>>()?;
            self.client
                .batch_write_item()
                .request_items(&self.table, requests)
                .send()
                .await
                .map_err(backend_error)?;
        }
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }
}

#[async_trait]
impl MosaicBackend for DynamoDbBackend {
    fn input(&self) -> &str {
        &self.uri
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn mosaic_def(&self) -> &MosaicJSON {
        &self.mosaic
    }

    fn mosaic_def_mut(&mut self) -> &mut MosaicJSON {
        &mut self.mosaic
    }

    /// One keyed GET per quadkey; the document never holds the tile map.
    async fn quadkey_assets(&self, quadkey: &str) -> MosaicResult<Vec<String>> {
        let Some(item) = self.fetch_item(quadkey).await? else {
            return Ok(Vec::new());
        };
        let assets = match item.get("assets") {
            Some(AttributeValue::L(list)) => list
                .iter()
                .filter_map(|attr| attr.as_s().ok().cloned())
                .collect(),
            Some(AttributeValue::Ss(list)) => list.clone(),
            _ => Vec::new(),
        };
        Ok(assets)
    }

    async fn quadkeys(&self) -> MosaicResult<Vec<String>> {
        let mut quadkeys = Vec::new();
        let mut pages = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("mosaic = :name")
            .expression_attribute_values(":name", AttributeValue::S(self.mosaic_name.clone()))
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(backend_error)?;
            for item in page.items() {
                if let Some(AttributeValue::S(qk)) = item.get("quadkey") {
                    if qk != METADATA_QUADKEY {
                        quadkeys.push(qk.clone());
                    }
                }
            }
        }
        Ok(quadkeys)
    }

    async fn write(&mut self, overwrite: bool) -> MosaicResult<()> {
        self.ensure_table().await?;
        if self.mosaic_exists().await? {
            if !overwrite {
                return Err(MosaicError::MosaicExists(self.uri.clone()));
            }
            self.delete().await?;
        }

        let mut items = vec![self.metadata_item()?];
        for (quadkey, assets) in &self.mosaic.tiles {
            items.push(self.tile_item(quadkey, assets));
        }
        self.write_items(items).await?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }

    /// Write only the changed items instead of replaying the whole mosaic.
    async fn update(&mut self, features: &[Feature], options: &UpdateOptions) -> MosaicResult<()> {
        let partial = compute_update_partial(&self.mosaic, features, options)?;
        let mut items = Vec::with_capacity(partial.tiles.len() + 1);
        for (quadkey, new_assets) in &partial.tiles {
            let old_assets = self.quadkey_assets(quadkey).await?;
            let merged = merge_assets(new_assets, &old_assets, options.add_first);
            items.push(self.tile_item(quadkey, &merged));
        }
        apply_update_metadata(&mut self.mosaic, &partial);
        items.push(self.metadata_item()?);
        self.write_items(items).await?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }
}

fn value_to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(value_to_attr).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_attr(v)))
                .collect(),
        ),
    }
}

fn attr_to_value(attr: &AttributeValue) -> Value {
    match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .or_else(|_| {
                n.parse::<f64>()
                    .map(|f| Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
            })
            .unwrap_or(Value::Null),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::L(items) => Value::Array(items.iter().map(attr_to_value).collect()),
        AttributeValue::Ss(items) => {
            Value::Array(items.iter().map(|s| Value::String(s.clone())).collect())
        }
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attr_to_value(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_with_region() {
        let (region, table, mosaic) =
            parse_dynamodb_uri("dynamodb://eu-central-1/mosaics:demo").unwrap();
        assert_eq!(region.as_deref(), Some("eu-central-1"));
        assert_eq!(table, "mosaics");
        assert_eq!(mosaic, "demo");
    }

    #[test]
    fn uri_without_region_needs_three_slashes() {
        let (region, table, mosaic) = parse_dynamodb_uri("dynamodb:///mosaics:demo").unwrap();
        assert_eq!(region, None);
        assert_eq!(table, "mosaics");
        assert_eq!(mosaic, "demo");
    }

    #[test]
    fn uri_without_mosaic_name_is_invalid() {
        assert!(parse_dynamodb_uri("dynamodb://us-east-1/mosaics").is_err());
        assert!(parse_dynamodb_uri("dynamodb://us-east-1/:demo").is_err());
    }

    #[test]
    fn attribute_round_trip() {
        let value = serde_json::json!({
            "minzoom": 4,
            "bounds": [-10.0, -10.5, 10.0, 10.5],
            "name": "demo",
            "layers": {"a": ["x"]},
            "flag": true,
        });
        assert_eq!(attr_to_value(&value_to_attr(&value)), value);
    }
}
