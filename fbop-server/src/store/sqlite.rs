use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::{BigInt, Double, Text};
use diesel::sqlite::Sqlite;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::models::{DocumentRow, NewDocument};
use super::schema::documents;
use super::{
    ChangeSet, Data, Direction, DocPath, Document, DocumentStore, Filter, Query, StoreError,
    Subscription, Target, WriteBatch, WriteOp, change_channel,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Documents persisted as JSON rows in one SQLite table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<ConnectionManager<SqliteConnection>>,
    changes: broadcast::Sender<ChangeSet>,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StoreError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(SqliteStore {
            pool,
            changes: change_channel(),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let pool = self.pool.clone();
        let key = path.as_str().to_string();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<DocumentRow>, StoreError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(documents::table
                .filter(documents::path.eq(&key))
                .select(DocumentRow::as_select())
                .first::<DocumentRow>(&mut conn)
                .optional()?)
        })
        .await??;
        row.map(row_to_document).transpose()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }
        let changed = batch.changed_paths();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().timestamp_millis();
            conn.immediate_transaction::<_, StoreError, _>(|conn| {
                for op in batch.into_ops() {
                    apply_op(conn, op, now)?;
                }
                Ok(())
            })
        })
        .await??;
        trace!(ops = changed.len(), "sqlite store: committed batch");
        let _ = self.changes.send(Arc::new(changed));
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        query.validate()?;
        let (sql, binds) = build_select(query)?;
        let pool = self.pool.clone();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<DocumentRow>, StoreError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let mut q = diesel::sql_query(sql).into_boxed::<Sqlite>();
            for bind in binds {
                q = match bind {
                    Bind::Text(s) => q.bind::<Text, _>(s),
                    Bind::Int(i) => q.bind::<BigInt, _>(i),
                    Bind::Real(f) => q.bind::<Double, _>(f),
                };
            }
            Ok(q.load::<DocumentRow>(&mut conn)?)
        })
        .await??;
        rows.into_iter().map(row_to_document).collect()
    }

    fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        query.validate()?;
        let changes = self.changes.subscribe();
        Ok(Subscription::spawn(self.clone(), query, changes))
    }
}

fn apply_op(conn: &mut SqliteConnection, op: WriteOp, now: i64) -> Result<(), StoreError> {
    match op {
        WriteOp::Set(path, data) => {
            let json = serde_json::to_string(&data)?;
            let row = NewDocument {
                path: path.as_str(),
                collection_path: path.parent_collection(),
                collection_id: path.collection_id(),
                data: &json,
                updated_at: now,
            };
            diesel::insert_into(documents::table)
                .values(&row)
                .on_conflict(documents::path)
                .do_update()
                .set((documents::data.eq(&json), documents::updated_at.eq(now)))
                .execute(conn)?;
        }
        WriteOp::Update(path, fields) => {
            let existing = documents::table
                .filter(documents::path.eq(path.as_str()))
                .select(documents::data)
                .first::<String>(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            let mut merged: Data = serde_json::from_str(&existing)?;
            merged.extend(fields);
            let json = serde_json::to_string(&merged)?;
            diesel::update(documents::table.filter(documents::path.eq(path.as_str())))
                .set((documents::data.eq(&json), documents::updated_at.eq(now)))
                .execute(conn)?;
        }
        WriteOp::Delete(path) => {
            diesel::delete(documents::table.filter(documents::path.eq(path.as_str())))
                .execute(conn)?;
        }
    }
    Ok(())
}

fn row_to_document(row: DocumentRow) -> Result<Document, StoreError> {
    Ok(Document {
        path: DocPath::parse(&row.path)?,
        data: serde_json::from_str(&row.data)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

fn json_path(field: &str) -> Bind {
    Bind::Text(format!("$.{field}"))
}

/// Renders a [`Query`] as parameterized SQL. Field names only ever reach
/// the statement as bound JSON paths.
fn build_select(query: &Query) -> Result<(String, Vec<Bind>), StoreError> {
    let mut sql = String::from(
        "SELECT path, collection_path, collection_id, data, updated_at FROM documents WHERE ",
    );
    let mut binds = Vec::new();
    match &query.target {
        Target::Collection(c) => {
            sql.push_str("collection_path = ?");
            binds.push(Bind::Text(c.clone()));
        }
        Target::CollectionGroup(id) => {
            sql.push_str("collection_id = ?");
            binds.push(Bind::Text(id.clone()));
        }
        Target::Document(p) => {
            sql.push_str("path = ?");
            binds.push(Bind::Text(p.as_str().to_string()));
        }
    }

    for filter in &query.filters {
        let (op, field, value) = match filter {
            Filter::Eq(f, v) => ("=", f, v),
            Filter::Lt(f, v) => ("<", f, v),
        };
        // Type guard keeps comparisons within one JSON kind, as the in-memory store does.
        let (types, bind) = match value {
            Value::String(s) => ("'text'", Bind::Text(s.clone())),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => ("'integer', 'real'", Bind::Int(i)),
                (None, Some(f)) => ("'integer', 'real'", Bind::Real(f)),
                (None, None) => {
                    return Err(StoreError::InvalidInput(format!("unsupported number {n}")));
                }
            },
            Value::Bool(b) => ("'true', 'false'", Bind::Int(i64::from(*b))),
            Value::Null if op == "=" => {
                sql.push_str(" AND json_type(data, ?) = 'null'");
                binds.push(json_path(field));
                continue;
            }
            _ => {
                return Err(StoreError::InvalidInput(format!(
                    "unsupported comparison on {field}"
                )));
            }
        };
        sql.push_str(&format!(
            " AND json_type(data, ?) IN ({types}) AND json_extract(data, ?) {op} ?"
        ));
        binds.push(json_path(field));
        binds.push(json_path(field));
        binds.push(bind);
    }

    match &query.order {
        Some((field, direction)) => {
            let dir = match direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            sql.push_str(&format!(
                " AND json_type(data, ?) IS NOT NULL ORDER BY json_extract(data, ?) {dir}, path ASC"
            ));
            binds.push(json_path(field));
            binds.push(json_path(field));
        }
        None => sql.push_str(" ORDER BY path ASC"),
    }

    if let Some(n) = query.limit {
        sql.push_str(" LIMIT ?");
        binds.push(Bind::Int(i64::try_from(n).unwrap_or(i64::MAX)));
    }
    Ok((sql, binds))
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("docs.db");
        let store = SqliteStore::connect(db.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn data(v: Value) -> Data {
        v.as_object().cloned().unwrap()
    }

    fn path(p: &str) -> DocPath {
        DocPath::parse(p).unwrap()
    }

    #[test]
    fn select_binds_every_value() {
        let q = Query::collection_group("invites")
            .where_lt("expiresAt", 1000)
            .limit(500);
        let (sql, binds) = build_select(&q).unwrap();
        assert_eq!(sql.matches('?').count(), binds.len());
        assert!(!sql.contains("expiresAt"));
        assert_eq!(binds.last(), Some(&Bind::Int(500)));
    }

    #[tokio::test]
    async fn roundtrips_and_merges_documents() {
        let (_dir, store) = open().await;
        let p = path("families/F1/children/C1");
        store
            .set(&p, data(json!({"id": "C1", "name": "Ann"})))
            .await
            .unwrap();
        store
            .update(&p, data(json!({"name": "Annie"})))
            .await
            .unwrap();
        let doc = store.get(&p).await.unwrap().unwrap();
        assert_eq!(doc.data, data(json!({"id": "C1", "name": "Annie"})));

        let missing = path("families/F1/children/C9");
        assert!(matches!(
            store.update(&missing, Data::new()).await,
            Err(StoreError::NotFound(_))
        ));
        store.delete(&p).await.unwrap();
        store.delete(&p).await.unwrap();
        assert!(store.get(&p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_update_rolls_back_batch() {
        let (_dir, store) = open().await;
        let mut batch = WriteBatch::new();
        batch
            .set(path("inviteCodes/AAAA2222"), data(json!({"expiresAt": 1})))
            .update(path("families/NOPE"), data(json!({"name": "x"})));
        assert!(store.commit(batch).await.is_err());
        assert!(store.get(&path("inviteCodes/AAAA2222")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queries_filter_order_and_limit() {
        let (_dir, store) = open().await;
        let mut batch = WriteBatch::new();
        batch
            .set(path("inviteCodes/A"), data(json!({"expiresAt": 10})))
            .set(path("inviteCodes/B"), data(json!({"expiresAt": 30})))
            .set(path("inviteCodes/C"), data(json!({"expiresAt": "20"})))
            .set(path("families/F1/invites/A"), data(json!({"expiresAt": 5})))
            .set(path("families/F2/invites/D"), data(json!({"expiresAt": 50})));
        store.commit(batch).await.unwrap();

        let expired = store
            .query(&Query::collection("inviteCodes").where_lt("expiresAt", 25))
            .await
            .unwrap();
        let ids: Vec<_> = expired.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["A"]);

        let group = store
            .query(
                &Query::collection_group("invites")
                    .order_by("expiresAt", Direction::Desc)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].path.as_str(), "families/F2/invites/D");

        let one = store
            .query(&Query::document(path("inviteCodes/B")))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn subscription_sees_commits() {
        let (_dir, store) = open().await;
        let p = path("families/F1/children/C1/devices/D1");
        let mut sub = store.subscribe(Query::document(p.clone())).unwrap();
        assert!(sub.next_snapshot().await.unwrap().unwrap().is_empty());
        store
            .set(&p, data(json!({"deviceName": "Pixel 8"})))
            .await
            .unwrap();
        let snap = sub.next_snapshot().await.unwrap().unwrap();
        assert_eq!(snap[0].data["deviceName"], "Pixel 8");
        store.delete(&p).await.unwrap();
        assert!(sub.next_snapshot().await.unwrap().unwrap().is_empty());
    }
}
