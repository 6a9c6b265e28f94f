use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;

use crate::application::repos::{
    CreatedOrder, DocumentQuery, DocumentStore, DocumentTransaction, StoreError,
};
use crate::domain::entities::{DocumentKey, DocumentRecord, SiteKey};

use super::{PostgresDocumentStore, map_sqlx_error};

const DOCUMENT_COLUMNS: &str = "site, name, title, description, category, tags, contents, \
    created, last_modified, published, chain_member, prev_name, next_name";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    site: String,
    name: String,
    title: String,
    description: String,
    category: String,
    tags: Vec<String>,
    contents: String,
    created: OffsetDateTime,
    last_modified: OffsetDateTime,
    published: bool,
    chain_member: bool,
    prev_name: Option<String>,
    next_name: Option<String>,
}

impl TryFrom<DocumentRow> for DocumentRecord {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let site = SiteKey::new(row.site).map_err(|err| StoreError::corrupt(err.to_string()))?;
        let link = |name: Option<String>| name.map(|name| DocumentKey::new(&site, name));
        Ok(Self {
            key: DocumentKey::new(&site, row.name),
            title: row.title,
            description: row.description,
            category: row.category,
            tags: row.tags,
            contents: row.contents,
            created: row.created,
            last_modified: row.last_modified,
            published: row.published,
            chain_member: row.chain_member,
            prev: link(row.prev_name),
            next: link(row.next_name),
        })
    }
}

/// Links are stored by name only, so they must stay inside the document's site.
fn link_name<'a>(
    doc: &DocumentRecord,
    link: &'a Option<DocumentKey>,
) -> Result<Option<&'a str>, StoreError> {
    match link {
        Some(key) if key.site != doc.key.site => Err(StoreError::corrupt(format!(
            "link from `{}` to `{}` crosses site scope",
            doc.key, key
        ))),
        Some(key) => Ok(Some(key.name.as_str())),
        None => Ok(None),
    }
}

async fn select_one(
    conn: &mut PgConnection,
    key: &DocumentKey,
) -> Result<DocumentRecord, StoreError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE site = $1 AND name = $2");
    let row = sqlx::query_as::<_, DocumentRow>(&sql)
        .bind(key.site.as_str())
        .bind(key.name.as_str())
        .fetch_optional(conn)
        .await
        .map_err(map_sqlx_error)?;

    row.ok_or(StoreError::NotFound)?.try_into()
}

async fn select_many(
    conn: &mut PgConnection,
    query: &DocumentQuery,
) -> Result<Vec<DocumentRecord>, StoreError> {
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT ");
    qb.push(DOCUMENT_COLUMNS);
    qb.push(" FROM documents WHERE site = ");
    qb.push_bind(query.site.as_str());

    if let Some(published) = query.published {
        qb.push(" AND published = ");
        qb.push_bind(published);
    }
    if let Some(chain_member) = query.chain_member {
        qb.push(" AND chain_member = ");
        qb.push_bind(chain_member);
    }

    match query.order {
        // Byte-wise name order, matching `domain::chain::chronological`.
        CreatedOrder::Ascending => qb.push(r#" ORDER BY created ASC, name COLLATE "C" ASC"#),
        CreatedOrder::Descending => qb.push(r#" ORDER BY created DESC, name COLLATE "C" DESC"#),
    };

    if let Some(limit) = query.limit {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::corrupt("query limit exceeds supported range"))?;
        qb.push(" LIMIT ");
        qb.push_bind(limit);
    }

    let rows = qb
        .build_query_as::<DocumentRow>()
        .fetch_all(conn)
        .await
        .map_err(map_sqlx_error)?;

    rows.into_iter().map(DocumentRecord::try_from).collect()
}

async fn upsert(conn: &mut PgConnection, doc: &DocumentRecord) -> Result<(), StoreError> {
    let prev = link_name(doc, &doc.prev)?;
    let next = link_name(doc, &doc.next)?;

    sqlx::query(
        r#"
        INSERT INTO documents (
            site, name, title, description, category, tags, contents,
            created, last_modified, published, chain_member, prev_name, next_name
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (site, name) DO UPDATE SET
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            category = EXCLUDED.category,
            tags = EXCLUDED.tags,
            contents = EXCLUDED.contents,
            created = EXCLUDED.created,
            last_modified = EXCLUDED.last_modified,
            published = EXCLUDED.published,
            chain_member = EXCLUDED.chain_member,
            prev_name = EXCLUDED.prev_name,
            next_name = EXCLUDED.next_name
        "#,
    )
    .bind(doc.key.site.as_str())
    .bind(doc.key.name.as_str())
    .bind(doc.title.as_str())
    .bind(doc.description.as_str())
    .bind(doc.category.as_str())
    .bind(&doc.tags)
    .bind(doc.contents.as_str())
    .bind(doc.created)
    .bind(doc.last_modified)
    .bind(doc.published)
    .bind(doc.chain_member)
    .bind(prev)
    .bind(next)
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

async fn update_links(conn: &mut PgConnection, doc: &DocumentRecord) -> Result<(), StoreError> {
    let prev = link_name(doc, &doc.prev)?;
    let next = link_name(doc, &doc.next)?;

    let result = sqlx::query(
        "UPDATE documents SET prev_name = $3, next_name = $4 WHERE site = $1 AND name = $2",
    )
    .bind(doc.key.site.as_str())
    .bind(doc.key.name.as_str())
    .bind(prev)
    .bind(next)
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        select_one(&mut conn, key).await
    }

    async fn put(&self, doc: &DocumentRecord) -> Result<(), StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        upsert(&mut conn, doc).await
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        select_many(&mut conn, query).await
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DocumentTransaction for PostgresTransaction {
    async fn get(&mut self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        select_one(&mut self.tx, key).await
    }

    async fn query(&mut self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        select_many(&mut self.tx, query).await
    }

    async fn put(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        upsert(&mut self.tx, doc).await
    }

    async fn update_links(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        update_links(&mut self.tx, doc).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }
}
