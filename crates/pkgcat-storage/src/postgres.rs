//! PostgreSQL-backed catalog store.

use async_trait::async_trait;
use chrono::Utc;
use pkgcat_core::{
    EnumField, PackageFilter, PackagePage, PackageType, PackageUpdate, Platform, PlatformId,
    RawPackageRecord, Repository, SortBy, SortOrder, StoredPackage,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{CatalogStore, StoreError};

const PACKAGE_COLUMNS: &str = "id, name, version, description, platform_id, repository, package_type, \
     popularity_score, license, homepage, is_active, created_at, updated_at, last_seen_at";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn constraint_for(field: EnumField) -> &'static str {
    match field {
        EnumField::Repository => "packages_repository_check",
        EnumField::PackageType => "packages_package_type_check",
    }
}

/// `pg_get_constraintdef` renders `CHECK (repository IN ('official', ...))` as an
/// `= ANY (ARRAY['official'::text, ...])` expression; both spellings quote the value.
fn constraint_permits(definition: &str, value: &str) -> bool {
    definition.contains(&format!("'{value}'"))
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// CHECK violations carry the constraint name, which tells us which enum column refused the row.
fn check_violation(
    err: &sqlx::Error,
    repository: Repository,
    package_type: PackageType,
) -> Option<StoreError> {
    if sqlstate(err).as_deref() != Some("23514") {
        return None;
    }
    let constraint = err.as_database_error().and_then(|db| db.constraint());
    Some(if constraint == Some(constraint_for(EnumField::PackageType)) {
        StoreError::ConstraintViolation {
            field: EnumField::PackageType,
            value: package_type.to_string(),
        }
    } else {
        StoreError::ConstraintViolation {
            field: EnumField::Repository,
            value: repository.to_string(),
        }
    })
}

fn map_insert_error(err: sqlx::Error, record: &RawPackageRecord) -> StoreError {
    if let Some(violation) = check_violation(&err, record.repository, record.package_type) {
        return violation;
    }
    match sqlstate(&err).as_deref() {
        Some("23505") => StoreError::DuplicateKey {
            name: record.name.clone(),
            platform: record.platform_id,
        },
        Some("23503") => StoreError::UnknownPlatform(record.platform_id),
        _ => StoreError::Database(err),
    }
}

fn map_update_error(err: sqlx::Error, update: &PackageUpdate) -> StoreError {
    check_violation(&err, update.repository, update.package_type)
        .unwrap_or(StoreError::Database(err))
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn row_to_package(row: &PgRow) -> Result<StoredPackage, StoreError> {
    let popularity: i16 = row.try_get("popularity_score")?;
    Ok(StoredPackage {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        platform_id: parse_column(row, "platform_id")?,
        repository: parse_column(row, "repository")?,
        package_type: parse_column(row, "package_type")?,
        popularity_score: popularity.clamp(0, 100) as u8,
        license: row.try_get("license")?,
        homepage: row.try_get("homepage")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &PackageFilter) {
    qb.push(" WHERE is_active = TRUE");
    if let Some(platform) = filter.platform_id {
        qb.push(" AND platform_id = ").push_bind(platform.as_str());
    }
    if let Some(package_type) = filter.package_type {
        qb.push(" AND package_type = ").push_bind(package_type.as_str());
    }
    if let Some(repository) = filter.repository {
        qb.push(" AND repository = ").push_bind(repository.as_str());
    }
    if let Some(term) = filter.search_term() {
        let pattern = format!("%{}%", escape_like(&term));
        qb.push(" AND (LOWER(name) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR LOWER(description) LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

fn order_clause(filter: &PackageFilter) -> String {
    let column = match filter.sort_by {
        SortBy::Name => "name",
        SortBy::Popularity => "popularity_score",
        SortBy::UpdatedAt => "updated_at",
    };
    let direction = match filter.sort_order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!(" ORDER BY {column} {direction}, name ASC, platform_id ASC")
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find_package(
        &self,
        name: &str,
        platform_id: PlatformId,
    ) -> Result<Option<StoredPackage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages WHERE name = $1 AND platform_id = $2"
        ))
        .bind(name)
        .bind(platform_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_package).transpose()
    }

    async fn insert_package(&self, record: &RawPackageRecord) -> Result<StoredPackage, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO packages (id, name, version, description, platform_id, repository, package_type,
                                  popularity_score, license, homepage, is_active, created_at, updated_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11, $11, $11)
            RETURNING {PACKAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.description)
        .bind(record.platform_id.as_str())
        .bind(record.repository.as_str())
        .bind(record.package_type.as_str())
        .bind(i16::from(record.popularity_score.min(100)))
        .bind(&record.license)
        .bind(&record.homepage)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, record))?;
        row_to_package(&row)
    }

    async fn update_package(&self, id: Uuid, update: &PackageUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE packages
               SET version = $2,
                   description = $3,
                   repository = $4,
                   package_type = $5,
                   popularity_score = $6,
                   license = $7,
                   homepage = $8,
                   updated_at = NOW(),
                   last_seen_at = CASE WHEN $9 THEN NOW() ELSE last_seen_at END,
                   is_active = CASE WHEN $9 THEN TRUE ELSE is_active END
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.version)
        .bind(&update.description)
        .bind(update.repository.as_str())
        .bind(update.package_type.as_str())
        .bind(i16::from(update.popularity_score.min(100)))
        .bind(&update.license)
        .bind(&update.homepage)
        .bind(update.mark_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| map_update_error(e, update))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn touch_package(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE packages SET last_seen_at = NOW(), is_active = TRUE WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn ensure_platform(&self, platform: &Platform) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platforms (id, name, package_manager)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                package_manager = EXCLUDED.package_manager
            "#,
        )
        .bind(platform.id.as_str())
        .bind(&platform.name)
        .bind(&platform.package_manager)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supports_enum_value(&self, field: EnumField, value: &str) -> Result<bool, StoreError> {
        let definition: Option<String> = sqlx::query_scalar(
            r#"
            SELECT pg_get_constraintdef(c.oid)
              FROM pg_constraint c
              JOIN pg_class t ON t.oid = c.conrelid
             WHERE t.relname = 'packages'
               AND c.conname = $1
            "#,
        )
        .bind(constraint_for(field))
        .fetch_optional(&self.pool)
        .await?;
        Ok(match definition {
            Some(definition) => constraint_permits(&definition, value),
            None => true,
        })
    }

    async fn list_packages(&self, filter: &PackageFilter) -> Result<PackagePage, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM packages");
        push_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {PACKAGE_COLUMNS} FROM packages"));
        push_filters(&mut select, filter);
        select.push(order_clause(filter));
        select
            .push(" LIMIT ")
            .push_bind(i64::from(filter.effective_limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));
        let rows = select.build().fetch_all(&self.pool).await?;

        let packages = rows.iter().map(row_to_package).collect::<Result<Vec<_>, _>>()?;
        Ok(PackagePage {
            packages,
            total: total.max(0) as u64,
        })
    }

    async fn list_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        let rows = sqlx::query("SELECT id, name, package_manager FROM platforms ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Platform {
                    id: parse_column(row, "id")?,
                    name: row.try_get("name")?,
                    package_manager: row.try_get("package_manager")?,
                })
            })
            .collect()
    }
}
