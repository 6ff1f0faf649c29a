use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};

use super::RepositoryFilter;
use crate::database::{connect_options, DatabaseConfiguration};
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ProjectRecord {
    pub id: i64,
    pub storage: String,
    pub full_path: String,
    pub has_design: bool,
    /// `project_repositories.disk_path`, when the row exists.
    pub disk_path: Option<String>,
    /// `NULL`/`0` is legacy storage, `1` and up is hashed storage.
    pub storage_version: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SnippetRecord {
    pub id: i64,
    pub storage: String,
    /// `None` for personal snippets.
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct GroupWikiRecord {
    pub group_id: i64,
    pub storage: String,
    pub full_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ObjectPoolRecord {
    pub id: i64,
    pub disk_path: String,
    pub source_project_id: Option<i64>,
}

/// Read access to the application's repository metadata.
///
/// Batches are keyset-paginated: each call returns up to `limit` rows with an
/// id strictly greater than `after_id`, ordered by id. Filters are applied
/// here, never to the produced jobs.
#[async_trait]
pub trait RepositoryCatalog: Send + Sync {
    async fn projects(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<ProjectRecord>>;

    async fn snippets(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<SnippetRecord>>;

    async fn group_wikis(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<GroupWikiRecord>>;

    async fn object_pools(&self) -> Result<Vec<ObjectPoolRecord>>;

    /// Puts the pool back to `none`, the state the application rebuilds from.
    async fn reset_object_pool(&self, pool_id: i64) -> Result<()>;
}

/// [`RepositoryCatalog`] over the GitLab schema.
pub struct PgRepositoryCatalog {
    pool: PgPool,
}

impl PgRepositoryCatalog {
    /// No connection is opened until the first query.
    pub fn connect_lazy(config: &DatabaseConfiguration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy_with(connect_options(config)?);
        Ok(Self { pool })
    }
}

fn like_prefix(path: &str) -> String {
    let escaped = path
        .trim_end_matches('/')
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}/%", escaped)
}

/// Appends `AND <column> matches paths` / `AND NOT <column> matches skip_paths`.
/// With `keep_unpathed`, rows whose column is NULL survive the skip clause.
fn push_path_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    filter: &RepositoryFilter,
    keep_unpathed: bool,
) {
    if !filter.paths.is_empty() {
        builder.push(" AND ");
        push_path_match(builder, column, &filter.paths);
    }
    if !filter.skip_paths.is_empty() {
        if keep_unpathed {
            builder.push(format!(" AND ({} IS NULL OR NOT ", column));
            push_path_match(builder, column, &filter.skip_paths);
            builder.push(")");
        } else {
            builder.push(" AND NOT ");
            push_path_match(builder, column, &filter.skip_paths);
        }
    }
}

fn push_path_match(builder: &mut QueryBuilder<'_, Postgres>, column: &str, paths: &[String]) {
    let exact: Vec<String> = paths.iter().map(|p| p.trim_end_matches('/').to_string()).collect();
    let prefixes: Vec<String> = paths.iter().map(|p| like_prefix(p)).collect();
    builder.push(format!("({} = ANY(", column));
    builder.push_bind(exact);
    builder.push(format!(") OR {} LIKE ANY(", column));
    builder.push_bind(prefixes);
    builder.push("))");
}

fn push_storage_filter(builder: &mut QueryBuilder<'_, Postgres>, column: &str, filter: &RepositoryFilter) {
    if !filter.storages.is_empty() {
        builder.push(format!(" AND {} = ANY(", column));
        builder.push_bind(filter.storages.clone());
        builder.push(")");
    }
}

fn push_page(builder: &mut QueryBuilder<'_, Postgres>, id_column: &str, limit: i64) {
    builder.push(format!(" ORDER BY {} LIMIT ", id_column));
    builder.push_bind(limit);
}

#[async_trait]
impl RepositoryCatalog for PgRepositoryCatalog {
    async fn projects(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<ProjectRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT p.id::bigint AS id, p.repository_storage AS storage, r.path AS full_path, \
             EXISTS (SELECT 1 FROM design_management_designs d WHERE d.project_id = p.id) AS has_design, \
             pr.disk_path AS disk_path, p.storage_version::int AS storage_version \
             FROM projects p \
             JOIN routes r ON r.source_type = 'Project' AND r.source_id = p.id \
             LEFT JOIN project_repositories pr ON pr.project_id = p.id \
             WHERE p.id > ",
        );
        builder.push_bind(after_id);
        push_storage_filter(&mut builder, "p.repository_storage", filter);
        push_path_filter(&mut builder, "r.path", filter, false);
        push_page(&mut builder, "p.id", limit);

        Ok(builder.build_query_as::<ProjectRecord>().fetch_all(&self.pool).await?)
    }

    async fn snippets(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<SnippetRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT s.id::bigint AS id, sh.name AS storage, r.path AS project_path \
             FROM snippets s \
             JOIN snippet_repositories sr ON sr.snippet_id = s.id \
             JOIN shards sh ON sh.id = sr.shard_id \
             LEFT JOIN routes r ON r.source_type = 'Project' AND r.source_id = s.project_id \
             WHERE s.id > ",
        );
        builder.push_bind(after_id);
        push_storage_filter(&mut builder, "sh.name", filter);
        // Personal snippets have no route: `paths` drops them, `skip_paths` keeps them.
        push_path_filter(&mut builder, "r.path", filter, true);
        push_page(&mut builder, "s.id", limit);

        Ok(builder.build_query_as::<SnippetRecord>().fetch_all(&self.pool).await?)
    }

    async fn group_wikis(&self, filter: &RepositoryFilter, after_id: i64, limit: i64) -> Result<Vec<GroupWikiRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT g.group_id::bigint AS group_id, sh.name AS storage, r.path AS full_path \
             FROM group_wiki_repositories g \
             JOIN shards sh ON sh.id = g.shard_id \
             JOIN routes r ON r.source_type = 'Namespace' AND r.source_id = g.group_id \
             WHERE g.group_id > ",
        );
        builder.push_bind(after_id);
        push_storage_filter(&mut builder, "sh.name", filter);
        push_path_filter(&mut builder, "r.path", filter, false);
        push_page(&mut builder, "g.group_id", limit);

        Ok(builder.build_query_as::<GroupWikiRecord>().fetch_all(&self.pool).await?)
    }

    async fn object_pools(&self) -> Result<Vec<ObjectPoolRecord>> {
        let pools = sqlx::query_as::<_, ObjectPoolRecord>(
            "SELECT id::bigint AS id, COALESCE(disk_path, '') AS disk_path, source_project_id::bigint AS source_project_id \
             FROM pool_repositories ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pools)
    }

    async fn reset_object_pool(&self, pool_id: i64) -> Result<()> {
        sqlx::query("UPDATE pool_repositories SET state = 'none' WHERE id = $1")
            .bind(pool_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
