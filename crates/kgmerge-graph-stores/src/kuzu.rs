//! Kuzu graph store implementation.
//!
//! Talks to a Kuzu API server over HTTP: every operation is one Cypher query
//! posted to `{url}/cypher` as `{"query": ..., "params": {...}}`. Entity
//! tables are keyed by `name`; relations live in a single `Relation` rel
//! table keyed by `relation_id`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use kgmerge_core::config::EntitySchema;
use kgmerge_core::error::{ErrorCode, KgError, KgResult};
use kgmerge_core::traits::{EntityStore, GraphStoreConfig};
use kgmerge_core::types::{
    AttributeValue, Attributes, EntityPayload, RelationUpdate, StoredEntity, StoredRelation,
};

const RELATION_TABLE: &str = "Relation";

/// Properties the store manages itself; never copied into attributes.
const RESERVED_PROPERTIES: &[&str] = &["name", "embedding", "_id", "_label"];

#[derive(Debug, Deserialize)]
struct CypherResponse {
    #[serde(default)]
    rows: Option<Vec<Value>>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

impl CypherResponse {
    fn into_rows(self) -> Vec<Value> {
        match (self.rows, self.data) {
            (Some(rows), _) if !rows.is_empty() => rows,
            (_, Some(data)) => data,
            (rows, None) => rows.unwrap_or_default(),
        }
    }
}

/// Kuzu HTTP API store.
pub struct KuzuStore {
    client: Client,
    base_url: String,
    schema: BTreeMap<String, EntitySchema>,
}

impl KuzuStore {
    /// Create a store for the server at `config.url`.
    ///
    /// `schema` is the declared storage schema; writes drop properties it
    /// does not declare.
    pub fn new(
        config: &GraphStoreConfig,
        schema: BTreeMap<String, EntitySchema>,
        timeout: Duration,
    ) -> KgResult<Self> {
        let base = url::Url::parse(&config.url)
            .map_err(|e| KgError::Configuration(format!("Invalid Kuzu URL '{}': {}", config.url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KgError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            schema,
        })
    }

    fn cypher_url(&self) -> String {
        format!("{}/cypher", self.base_url)
    }

    /// Run one query and return its rows.
    async fn execute(&self, query: &str, params: Value) -> KgResult<Vec<Value>> {
        tracing::debug!("Executing query: {}", query.trim());
        let response = self
            .client
            .post(self.cypher_url())
            .json(&json!({ "query": query, "params": params }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KgError::transient_store(format!("Kuzu request timed out: {}", e))
                } else {
                    KgError::transient_store(format!("Kuzu request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Kuzu API error: {} - {}", status.as_u16(), body);
            return Err(KgError::from_http_status(status.as_u16(), &body));
        }

        let parsed: CypherResponse = response
            .json()
            .await
            .map_err(|e| KgError::fatal_store(format!("Failed to parse Kuzu response: {}", e)))?;
        Ok(parsed.into_rows())
    }

    fn schema(&self, entity_type: &str) -> KgResult<&EntitySchema> {
        self.schema
            .get(entity_type)
            .ok_or_else(|| KgError::schema_violation(format!("Unknown entity type: {}", entity_type)))
    }

    /// Keep only properties the schema declares, as Cypher parameters.
    fn filter_properties(&self, entity_type: &str, attributes: &Attributes) -> KgResult<Map<String, Value>> {
        let schema = self.schema(entity_type)?;
        let mut props = Map::new();
        for (field, value) in attributes {
            if field == "name" {
                continue;
            }
            if !schema.has_field(field) {
                tracing::warn!("Property '{}' not found in schema for {}, skipping", field, entity_type);
                continue;
            }
            validate_identifier(field)?;
            let value = if schema.is_array(field) {
                Value::from(value.to_list())
            } else {
                value.to_json()
            };
            props.insert(field.clone(), value);
        }
        Ok(props)
    }

    fn declares(&self, entity_type: &str, field: &str) -> bool {
        self.schema.get(entity_type).is_some_and(|s| s.has_field(field))
    }
}

/// Check that a label or property name is safe to interpolate into Cypher.
pub fn validate_identifier(identifier: &str) -> KgResult<&str> {
    let mut chars = identifier.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(identifier)
    } else {
        Err(KgError::Validation {
            message: format!("'{}' is not a valid identifier", identifier),
            code: ErrorCode::ValInvalidIdentifier,
            details: Default::default(),
            suggestion: Some("Use letters, digits and underscores only".to_string()),
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn embedding_param(embedding: &[f32]) -> Value {
    Value::from(embedding.iter().map(|v| f64::from(*v)).collect::<Vec<_>>())
}

fn parse_embedding(value: Option<&Value>) -> Option<Vec<f32>> {
    let items = value?.as_array()?;
    if items.is_empty() {
        return None;
    }
    items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect()
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(AttributeValue::from_json)
        .map(|v| v.to_list())
        .unwrap_or_default()
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(String::from)
}

/// Convert a returned node into a stored entity.
pub fn entity_from_node(entity_type: &str, node: &Value) -> KgResult<StoredEntity> {
    let obj = node
        .as_object()
        .ok_or_else(|| KgError::fatal_store(format!("Expected a {} node, got {}", entity_type, node)))?;
    let name = text(obj.get("name"))
        .ok_or_else(|| KgError::fatal_store(format!("{} node without a name", entity_type)))?;

    let mut entity = StoredEntity::new(entity_type, name);
    for (field, raw) in obj {
        if RESERVED_PROPERTIES.contains(&field.as_str()) {
            continue;
        }
        if let Some(value) = AttributeValue::from_json(raw) {
            if !value.is_empty() {
                entity.attributes.insert(field.clone(), value);
            }
        }
    }
    entity.embedding = parse_embedding(obj.get("embedding"));
    Ok(entity)
}

/// Convert a `RETURN r, source, source_type, target, target_type` row.
pub fn relation_from_row(row: &Value) -> KgResult<StoredRelation> {
    let r = row
        .get("r")
        .and_then(Value::as_object)
        .ok_or_else(|| KgError::fatal_store(format!("Expected a relation row, got {}", row)))?;
    let id = text(r.get("relation_id"))
        .ok_or_else(|| KgError::fatal_store("Relation without a relation_id"))?;

    Ok(StoredRelation {
        id,
        source: text(row.get("source")).unwrap_or_default(),
        source_type: text(row.get("source_type")).unwrap_or_default(),
        target: text(row.get("target")).unwrap_or_default(),
        target_type: text(row.get("target_type")).unwrap_or_default(),
        relation_type: text(r.get("type")).unwrap_or_default(),
        descriptions: strings(r.get("description")),
        tags: strings(r.get("relationTag")),
        permissions: strings(r.get("permissions")),
        sources: strings(r.get("sources")),
        strength: r.get("strength").and_then(Value::as_f64).unwrap_or(0.0),
        created_at: text(r.get("createdAt")).filter(|s| !s.is_empty()),
        last_updated: text(r.get("lastUpdated")).filter(|s| !s.is_empty()),
        embedding: parse_embedding(r.get("embedding")),
    })
}

/// Build the entity upsert. Arrays are unioned on match, scalars overwritten.
fn upsert_entity_query(
    entity_type: &str,
    name: &str,
    props: &Map<String, Value>,
    schema: &EntitySchema,
    embedding: Option<&[f32]>,
    stamp: Option<String>,
) -> (String, Value) {
    let mut params = Map::new();
    params.insert("name".to_string(), Value::from(name));

    let mut on_create = Vec::new();
    let mut on_match = Vec::new();
    for (field, value) in props {
        params.insert(field.clone(), value.clone());
        on_create.push(format!("n.{f} = ${f}", f = field));
        if schema.is_array(field) {
            on_match.push(format!(
                "n.{f} = list_distinct(list_concat(coalesce(n.{f}, []), ${f}))",
                f = field
            ));
        } else {
            on_match.push(format!("n.{f} = ${f}", f = field));
        }
    }
    if let Some(embedding) = embedding {
        params.insert("embedding".to_string(), embedding_param(embedding));
        on_create.push("n.embedding = $embedding".to_string());
        on_match.push("n.embedding = $embedding".to_string());
    }
    if let Some(stamp) = stamp {
        params.insert("current_time".to_string(), Value::from(stamp));
        on_create.push("n.lastUpdated = $current_time".to_string());
        on_match.push("n.lastUpdated = $current_time".to_string());
    }

    let mut query = format!("MERGE (n:{} {{name: $name}})", entity_type);
    if !on_create.is_empty() {
        query.push_str(&format!(" ON CREATE SET {}", on_create.join(", ")));
        query.push_str(&format!(" ON MATCH SET {}", on_match.join(", ")));
    }
    query.push_str(" RETURN n");
    (query, Value::Object(params))
}

fn relation_properties(relation: &StoredRelation) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("description".to_string(), Value::from(relation.descriptions.clone()));
    props.insert("relationTag".to_string(), Value::from(relation.tags.clone()));
    props.insert("type".to_string(), Value::from(relation.relation_type.clone()));
    props.insert("strength".to_string(), Value::from(relation.strength));
    props.insert("permissions".to_string(), Value::from(relation.permissions.clone()));
    props.insert("sources".to_string(), Value::from(relation.sources.clone()));
    if let Some(embedding) = &relation.embedding {
        props.insert("embedding".to_string(), embedding_param(embedding));
    }
    props
}

fn update_properties(update: &RelationUpdate) -> Map<String, Value> {
    let mut props = Map::new();
    if let Some(v) = &update.descriptions {
        props.insert("description".to_string(), Value::from(v.clone()));
    }
    if let Some(v) = &update.tags {
        props.insert("relationTag".to_string(), Value::from(v.clone()));
    }
    if let Some(v) = &update.permissions {
        props.insert("permissions".to_string(), Value::from(v.clone()));
    }
    if let Some(v) = &update.sources {
        props.insert("sources".to_string(), Value::from(v.clone()));
    }
    if let Some(v) = update.strength {
        props.insert("strength".to_string(), Value::from(v));
    }
    if let Some(v) = &update.embedding {
        props.insert("embedding".to_string(), embedding_param(v));
    }
    props
}

const RELATION_RETURN: &str =
    "RETURN r, a.name AS source, label(a) AS source_type, b.name AS target, label(b) AS target_type";

#[async_trait]
impl EntityStore for KuzuStore {
    async fn get_entity(&self, entity_type: &str, name: &str) -> KgResult<Option<StoredEntity>> {
        validate_identifier(entity_type)?;
        let query = format!("MATCH (n:{} {{name: $name}}) RETURN n", entity_type);
        let rows = self.execute(&query, json!({ "name": name })).await?;
        rows.first()
            .and_then(|row| row.get("n"))
            .map(|node| entity_from_node(entity_type, node))
            .transpose()
    }

    async fn create_entity(&self, entity_type: &str, payload: &EntityPayload) -> KgResult<StoredEntity> {
        validate_identifier(entity_type)?;
        let name = payload
            .name()
            .ok_or_else(|| KgError::schema_violation(format!("{} create without a name", entity_type)))?;
        let props = self.filter_properties(entity_type, &payload.attributes)?;
        let schema = self.schema(entity_type)?;
        let embedding = payload
            .embedding
            .as_deref()
            .filter(|_| schema.has_field("embedding"));
        let stamp = self.declares(entity_type, "lastUpdated").then(now);

        let (query, params) = upsert_entity_query(entity_type, name, &props, schema, embedding, stamp);
        let rows = self.execute(&query, params).await?;
        let node = rows
            .first()
            .and_then(|row| row.get("n"))
            .ok_or_else(|| KgError::fatal_store(format!("No data returned creating {}:{}", entity_type, name)))?;
        entity_from_node(entity_type, node)
    }

    async fn update_entity(
        &self,
        entity_type: &str,
        name: &str,
        payload: &EntityPayload,
    ) -> KgResult<StoredEntity> {
        validate_identifier(entity_type)?;
        let props = self.filter_properties(entity_type, &payload.attributes)?;

        let mut params = Map::new();
        params.insert("entity_id".to_string(), Value::from(name));
        let mut sets: Vec<String> = Vec::new();
        for (field, value) in props {
            sets.push(format!("n.{f} = ${f}", f = field));
            params.insert(field, value);
        }
        if let Some(embedding) = &payload.embedding {
            if self.declares(entity_type, "embedding") {
                sets.push("n.embedding = $embedding".to_string());
                params.insert("embedding".to_string(), embedding_param(embedding));
            }
        }
        if sets.is_empty() {
            return self.get_entity(entity_type, name).await?.ok_or_else(|| KgError::NotFound {
                message: format!("{}:{}", entity_type, name),
                code: ErrorCode::StoreNotFound,
            });
        }
        if self.declares(entity_type, "lastUpdated") {
            sets.push("n.lastUpdated = $current_time".to_string());
            params.insert("current_time".to_string(), Value::from(now()));
        }

        let query = format!(
            "MATCH (n:{} {{name: $entity_id}}) SET {} RETURN n",
            entity_type,
            sets.join(", ")
        );
        let rows = self.execute(&query, Value::Object(params)).await?;
        match rows.first().and_then(|row| row.get("n")) {
            Some(node) => entity_from_node(entity_type, node),
            None => Err(KgError::NotFound {
                message: format!("{}:{}", entity_type, name),
                code: ErrorCode::StoreNotFound,
            }),
        }
    }

    async fn find_entity_by_predicate(
        &self,
        entity_type: &str,
        field: &str,
        value: &str,
        match_array: bool,
    ) -> KgResult<Option<StoredEntity>> {
        validate_identifier(entity_type)?;
        validate_identifier(field)?;
        let query = if match_array {
            format!(
                "MATCH (e:{}) WHERE ANY(x IN e.{} WHERE lower(x) = lower($value)) RETURN e LIMIT 1",
                entity_type, field
            )
        } else {
            format!(
                "MATCH (e:{}) WHERE lower(e.{}) = lower($value) RETURN e LIMIT 1",
                entity_type, field
            )
        };
        let rows = self.execute(&query, json!({ "value": value })).await?;
        rows.first()
            .and_then(|row| row.get("e"))
            .map(|node| entity_from_node(entity_type, node))
            .transpose()
    }

    async fn get_relation(&self, id: &str) -> KgResult<Option<StoredRelation>> {
        let query = format!(
            "MATCH (a)-[r:{}]->(b) WHERE r.relation_id = $relation_id {}",
            RELATION_TABLE, RELATION_RETURN
        );
        let rows = self.execute(&query, json!({ "relation_id": id })).await?;
        rows.first().map(relation_from_row).transpose()
    }

    async fn create_relation(&self, relation: &StoredRelation) -> KgResult<StoredRelation> {
        validate_identifier(&relation.source_type)?;
        validate_identifier(&relation.target_type)?;

        let props = relation_properties(relation);
        let stamp = relation.last_updated.clone().unwrap_or_else(now);
        let created = relation.created_at.clone().unwrap_or_else(|| stamp.clone());

        let mut params = props.clone();
        params.insert("from_entity_id".to_string(), Value::from(relation.source.clone()));
        params.insert("to_entity_id".to_string(), Value::from(relation.target.clone()));
        params.insert("relation_id".to_string(), Value::from(relation.id.clone()));
        params.insert("created_at".to_string(), Value::from(created));
        params.insert("current_time".to_string(), Value::from(stamp));

        let mut on_create: Vec<String> = props.keys().map(|k| format!("r.{k} = ${k}", k = k)).collect();
        on_create.push("r.createdAt = $created_at".to_string());
        on_create.push("r.lastUpdated = $current_time".to_string());
        let mut on_match: Vec<String> = props
            .keys()
            .filter(|k| k.as_str() != "sources")
            .map(|k| format!("r.{k} = ${k}", k = k))
            .collect();
        on_match.push("r.sources = list_distinct(list_concat(coalesce(r.sources, []), $sources))".to_string());
        on_match.push("r.lastUpdated = $current_time".to_string());

        let query = format!(
            "MATCH (a:{} {{name: $from_entity_id}}), (b:{} {{name: $to_entity_id}}) \
             MERGE (a)-[r:{} {{relation_id: $relation_id}}]->(b) \
             ON CREATE SET {} ON MATCH SET {} {}",
            relation.source_type,
            relation.target_type,
            RELATION_TABLE,
            on_create.join(", "),
            on_match.join(", "),
            RELATION_RETURN
        );
        let rows = self.execute(&query, Value::Object(params)).await?;
        match rows.first() {
            Some(row) => relation_from_row(row),
            None => Err(KgError::schema_violation(format!(
                "relation {} references a missing entity ({}:{} -> {}:{})",
                relation.id, relation.source_type, relation.source, relation.target_type, relation.target
            ))),
        }
    }

    async fn update_relation(&self, id: &str, update: &RelationUpdate) -> KgResult<StoredRelation> {
        let props = update_properties(update);
        let mut params = props.clone();
        params.insert("relation_id".to_string(), Value::from(id));
        params.insert(
            "current_time".to_string(),
            Value::from(update.last_updated.clone().unwrap_or_else(now)),
        );

        let mut sets: Vec<String> = props.keys().map(|k| format!("r.{k} = ${k}", k = k)).collect();
        sets.push("r.lastUpdated = $current_time".to_string());

        let query = format!(
            "MATCH (a)-[r:{}]->(b) WHERE r.relation_id = $relation_id SET {} {}",
            RELATION_TABLE,
            sets.join(", "),
            RELATION_RETURN
        );
        let rows = self.execute(&query, Value::Object(params)).await?;
        match rows.first() {
            Some(row) => relation_from_row(row),
            None => Err(KgError::NotFound {
                message: format!("relation {}", id),
                code: ErrorCode::StoreNotFound,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_schema() -> EntitySchema {
        EntitySchema::new()
            .with_field("name", "STRING")
            .with_field("aliases", "STRING[]")
            .with_field("title", "STRING")
            .with_field("embedding", "DOUBLE[]")
            .with_field("lastUpdated", "STRING")
    }

    fn store() -> KuzuStore {
        let mut schema = BTreeMap::new();
        schema.insert("Person".to_string(), person_schema());
        KuzuStore::new(
            &GraphStoreConfig {
                url: "http://127.0.0.1:1".to_string(),
                ..GraphStoreConfig::default()
            },
            schema,
            Duration::from_millis(500),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("Person").is_ok());
        assert!(validate_identifier("raw_descriptions2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        let err = validate_identifier("Person) DETACH DELETE n //").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValInvalidIdentifier);
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let config = GraphStoreConfig {
            url: "not a url".to_string(),
            ..GraphStoreConfig::default()
        };
        let err = KuzuStore::new(&config, BTreeMap::new(), Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, KgError::Configuration(_)));
    }

    #[test]
    fn test_filter_properties_drops_undeclared() {
        let store = store();
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), "Ada".into());
        attrs.insert("title".to_string(), "Engineer".into());
        attrs.insert("aliases".to_string(), "Countess".into());
        attrs.insert("shoeSize".to_string(), AttributeValue::Number(9.0));

        let props = store.filter_properties("Person", &attrs).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props["title"], json!("Engineer"));
        assert_eq!(props["aliases"], json!(["Countess"]));

        let err = store.filter_properties("Planet", &attrs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreSchemaViolation);
    }

    #[test]
    fn test_upsert_query_unions_arrays() {
        let mut props = Map::new();
        props.insert("aliases".to_string(), json!(["Countess"]));
        props.insert("title".to_string(), json!("Engineer"));
        let (query, params) =
            upsert_entity_query("Person", "Ada", &props, &person_schema(), None, Some("t".to_string()));

        assert!(query.starts_with("MERGE (n:Person {name: $name})"));
        assert!(query.contains("n.aliases = list_distinct(list_concat(coalesce(n.aliases, []), $aliases))"));
        assert!(query.contains("ON MATCH SET") && query.contains("n.title = $title"));
        assert!(query.contains("n.lastUpdated = $current_time"));
        assert_eq!(params["name"], json!("Ada"));
    }

    #[test]
    fn test_entity_from_node() {
        let node = json!({
            "_id": {"offset": 0, "table": 0},
            "_label": "Person",
            "name": "Ada",
            "aliases": ["Countess"],
            "title": "",
            "embedding": [0.5, 0.25],
        });
        let entity = entity_from_node("Person", &node).unwrap();
        assert_eq!(entity.name, "Ada");
        assert_eq!(entity.list("aliases"), vec!["Countess"]);
        assert!(!entity.attributes.contains_key("title"));
        assert!(!entity.attributes.contains_key("_label"));
        assert_eq!(entity.embedding, Some(vec![0.5, 0.25]));
    }

    #[test]
    fn test_relation_from_row() {
        let row = json!({
            "r": {
                "relation_id": "abc",
                "type": "WORKS_AT",
                "description": ["founder"],
                "relationTag": ["WORKS_AT"],
                "strength": 0.9,
                "sources": ["mail:1"],
                "createdAt": "",
            },
            "source": "Ada",
            "source_type": "Person",
            "target": "Acme",
            "target_type": "Organization",
        });
        let relation = relation_from_row(&row).unwrap();
        assert_eq!(relation.id, "abc");
        assert_eq!(relation.target_type, "Organization");
        assert_eq!(relation.descriptions, vec!["founder"]);
        assert!(relation.created_at.is_none());
        assert!(relation.permissions.is_empty());
    }

    #[test]
    fn test_response_rows_or_data() {
        let rows: CypherResponse = serde_json::from_value(json!({"rows": [{"n": 1}]})).unwrap();
        assert_eq!(rows.into_rows().len(), 1);
        let data: CypherResponse = serde_json::from_value(json!({"data": [{"n": 1}, {"n": 2}]})).unwrap();
        assert_eq!(data.into_rows().len(), 2);
        let empty: CypherResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.into_rows().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let err = store().get_entity("Person", "Ada").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_injection_rejected_before_request() {
        let err = store()
            .find_entity_by_predicate("Person", "name) RETURN 1 //", "x", false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValInvalidIdentifier);
    }
}
