/// Default implementation for a Repository that factors out common
/// query patterns / SQL queries between Postgres and SQLite.
///
/// Usage:
///
/// The struct has to have certain fields, since this macro relies on them:
///
/// ```ignore
/// pub struct MyRepository {
///     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>
/// }
///
/// impl MyRepository {
///     pub const MIGRATOR: sqlx::Migrator = sqlx::migrate!("my/migrations");
///     pub const QUERIES: RepositoryQueries = RepositoryQueries {
///         table_exists: "SELECT ...",
///         ...
///     }
///     pub fn interpret_error(error: sqlx::Error) -> Error {
///         // Interpret the database-specific error code and turn some sqlx errors
///         // into the Error enum values like UniqueConstraintViolation/FKConstraintViolation
///         // ...
///     }
/// }
///
/// implement_repository!(MyRepository, sqlx::SqlxDatabaseType)
/// ```
///
/// The code between PG and SQLite is nearly identical, but making it generic over
/// `sqlx::Database` runs into a wall of `Encode`/`Type` bounds and the `QueryBuilder`
/// borrow checker issue (https://github.com/launchbadge/sqlx/issues/1978), so the
/// implementation is stamped out per backend instead. This also means no compile-time
/// query checking, since half of the statements (DDL and row I/O against user tables)
/// are built at runtime anyway.
use crate::data_types::LogicalType;

/// Physical column type for every logical type, per dialect
pub struct PhysicalTypes {
    pub text: &'static str,
    pub integer: &'static str,
    pub uuid: &'static str,
    pub timestamp: &'static str,
    pub boolean: &'static str,
    pub json: &'static str,
}

impl PhysicalTypes {
    pub fn get(&self, logical_type: LogicalType) -> &'static str {
        match logical_type {
            LogicalType::Text => self.text,
            LogicalType::Integer => self.integer,
            LogicalType::Uuid => self.uuid,
            LogicalType::Timestamp => self.timestamp,
            LogicalType::Boolean => self.boolean,
            LogicalType::Json => self.json,
        }
    }
}

/// Queries that are different between SQLite and PG
pub struct RepositoryQueries {
    pub physical_types: PhysicalTypes,
    /// Returns a row iff the table `$1` exists
    pub table_exists: &'static str,
    /// Returns one `name` row per column of the table `$1`
    pub table_columns: &'static str,
    /// Appended to `DROP TABLE IF EXISTS <name>`
    pub drop_table_suffix: &'static str,
}

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident, $db: ty) => {

impl $repo {
    fn push_sql_value(builder: &mut QueryBuilder<'_, $db>, value: SqlValue) {
        match value {
            SqlValue::Text(v) => { builder.push_bind(v); }
            SqlValue::Integer(v) => { builder.push_bind(v); }
            SqlValue::Uuid(v) => { builder.push_bind(v); }
            SqlValue::Timestamp(v) => { builder.push_bind(v); }
            SqlValue::Boolean(v) => { builder.push_bind(v); }
            SqlValue::Json(v) => { builder.push_bind(v); }
        }
    }

    fn push_filters(builder: &mut QueryBuilder<'_, $db>, filters: Vec<(String, SqlValue)>) {
        for (i, (name, value)) in filters.into_iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            builder.push(quote_identifier(&name));
            if value.is_null() {
                builder.push(" IS NULL");
            } else {
                builder.push(" = ");
                Self::push_sql_value(builder, value);
            }
        }
    }

    fn column_list(columns: &[(String, LogicalType)]) -> String {
        columns.iter().map(|(name, _)| quote_identifier(name)).join(", ")
    }

    fn decode_row(
        row: &<$db as sqlx::Database>::Row,
        columns: &[(String, LogicalType)],
    ) -> Result<RowData, Error> {
        let mut result = RowData::new();
        for (name, logical_type) in columns {
            let column = name.as_str();
            let value = match logical_type {
                LogicalType::Text => SqlValue::Text(row.try_get(column).map_err($repo::interpret_error)?),
                LogicalType::Integer => SqlValue::Integer(row.try_get(column).map_err($repo::interpret_error)?),
                LogicalType::Uuid => SqlValue::Uuid(row.try_get(column).map_err($repo::interpret_error)?),
                LogicalType::Timestamp => SqlValue::Timestamp(row.try_get(column).map_err($repo::interpret_error)?),
                LogicalType::Boolean => SqlValue::Boolean(row.try_get(column).map_err($repo::interpret_error)?),
                LogicalType::Json => SqlValue::Json(row.try_get(column).map_err($repo::interpret_error)?),
            };
            result.insert(name.clone(), value.into_json());
        }
        Ok(result)
    }

    async fn execute_ddl(&self, sql: String) -> Result<(), Error> {
        debug!("Executing DDL: {sql}");
        sqlx::query(&sql)
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for $repo {
    async fn setup(&self) -> Result<(), Error> {
        $repo::MIGRATOR
            .run(&self.executor)
            .await
            .map_err(|e| Error::SqlxError(sqlx::Error::Migrate(Box::new(e))))
    }

    async fn create_table(
        &self,
        table: &TableRecord,
        columns: &[ColumnRecord],
    ) -> Result<(), Error> {
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        sqlx::query(
            "INSERT INTO meta_tables (id, name, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(table.id)
        .bind(table.name.clone())
        .bind(table.created_at)
        .bind(table.updated_at)
        .execute(&mut *tx)
        .await.map_err($repo::interpret_error)?;

        if !columns.is_empty() {
            let mut builder: QueryBuilder<$db> = QueryBuilder::new(
                "INSERT INTO meta_columns (id, table_id, name, type, required, materialized, ordinal, created_at, updated_at) ",
            );
            builder.push_values(columns, |mut b, col| {
                b.push_bind(col.id)
                    .push_bind(col.table_id)
                    .push_bind(col.name.clone())
                    .push_bind(col.r#type.clone())
                    .push_bind(col.required)
                    .push_bind(col.materialized)
                    .push_bind(col.ordinal)
                    .push_bind(col.created_at)
                    .push_bind(col.updated_at);
            });
            builder.build().execute(&mut *tx).await.map_err($repo::interpret_error)?;
        }

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn get_table(&self, table_id: TableId) -> Result<TableRecord, Error> {
        let table = sqlx::query_as(
            "SELECT id, name, created_at, updated_at FROM meta_tables WHERE id = $1",
        )
        .bind(table_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(table)
    }

    async fn get_table_by_name(&self, name: &str) -> Result<TableRecord, Error> {
        let table = sqlx::query_as(
            "SELECT id, name, created_at, updated_at FROM meta_tables WHERE name = $1",
        )
        .bind(name)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(table)
    }

    async fn list_tables(&self) -> Result<Vec<TableRecord>, Error> {
        let tables = sqlx::query_as(
            "SELECT id, name, created_at, updated_at FROM meta_tables ORDER BY created_at DESC, name",
        )
        .fetch(&self.executor)
        .try_collect()
        .await
        .map_err($repo::interpret_error)?;

        Ok(tables)
    }

    async fn get_columns(&self, table_id: TableId) -> Result<Vec<ColumnRecord>, Error> {
        let columns = sqlx::query_as(
            r#"SELECT id, table_id, name, type, required, materialized, ordinal, created_at, updated_at
            FROM meta_columns WHERE table_id = $1 ORDER BY ordinal"#,
        )
        .bind(table_id)
        .fetch(&self.executor)
        .try_collect()
        .await
        .map_err($repo::interpret_error)?;

        Ok(columns)
    }

    async fn list_all_columns(&self) -> Result<Vec<ColumnRecord>, Error> {
        let columns = sqlx::query_as(
            r#"SELECT id, table_id, name, type, required, materialized, ordinal, created_at, updated_at
            FROM meta_columns ORDER BY table_id, ordinal"#,
        )
        .fetch(&self.executor)
        .try_collect()
        .await
        .map_err($repo::interpret_error)?;

        Ok(columns)
    }

    async fn insert_columns(&self, columns: &[ColumnRecord]) -> Result<(), Error> {
        if columns.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<$db> = QueryBuilder::new(
            "INSERT INTO meta_columns (id, table_id, name, type, required, materialized, ordinal, created_at, updated_at) ",
        );
        builder.push_values(columns, |mut b, col| {
            b.push_bind(col.id)
                .push_bind(col.table_id)
                .push_bind(col.name.clone())
                .push_bind(col.r#type.clone())
                .push_bind(col.required)
                .push_bind(col.materialized)
                .push_bind(col.ordinal)
                .push_bind(col.created_at)
                .push_bind(col.updated_at);
        });
        builder.build().execute(&self.executor).await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn mark_columns_materialized(
        &self,
        column_ids: &[ColumnId],
        updated_at: Timestamp,
    ) -> Result<u64, Error> {
        if column_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new("UPDATE meta_columns SET materialized = TRUE, updated_at = ");
        builder.push_bind(updated_at);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in column_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.executor).await.map_err($repo::interpret_error)?;
        Ok(result.rows_affected())
    }

    async fn touch_table(
        &self,
        table_id: TableId,
        updated_at: Timestamp,
    ) -> Result<(), Error> {
        // RETURNING forces a row not found error if the table doesn't exist
        sqlx::query("UPDATE meta_tables SET updated_at = $1 WHERE id = $2 RETURNING id")
            .bind(updated_at)
            .bind(table_id)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn delete_table(&self, table_id: TableId) -> Result<(), Error> {
        sqlx::query("DELETE FROM meta_tables WHERE id = $1 RETURNING id")
            .bind(table_id)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn create_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), Error> {
        sqlx::query(
            r#"INSERT INTO meta_endpoints (id, name, method, path, flow_definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(endpoint.id)
        .bind(endpoint.name.clone())
        .bind(endpoint.method.clone())
        .bind(endpoint.path.clone())
        .bind(endpoint.flow_definition.clone())
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn get_endpoint(&self, endpoint_id: EndpointId) -> Result<EndpointRecord, Error> {
        let endpoint = sqlx::query_as(
            r#"SELECT id, name, method, path, flow_definition, created_at, updated_at
            FROM meta_endpoints WHERE id = $1"#,
        )
        .bind(endpoint_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(endpoint)
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, Error> {
        let endpoints = sqlx::query_as(
            r#"SELECT id, name, method, path, flow_definition, created_at, updated_at
            FROM meta_endpoints ORDER BY created_at DESC, id DESC"#,
        )
        .fetch(&self.executor)
        .try_collect()
        .await
        .map_err($repo::interpret_error)?;

        Ok(endpoints)
    }

    async fn update_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), Error> {
        sqlx::query(
            r#"UPDATE meta_endpoints
            SET name = $1, method = $2, path = $3, flow_definition = $4, updated_at = $5
            WHERE id = $6 RETURNING id"#,
        )
        .bind(endpoint.name.clone())
        .bind(endpoint.method.clone())
        .bind(endpoint.path.clone())
        .bind(endpoint.flow_definition.clone())
        .bind(endpoint.updated_at)
        .bind(endpoint.id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn delete_endpoint(&self, endpoint_id: EndpointId) -> Result<(), Error> {
        sqlx::query("DELETE FROM meta_endpoints WHERE id = $1 RETURNING id")
            .bind(endpoint_id)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn get_auth_settings(&self, key: &str) -> Result<AuthSettingsRecord, Error> {
        let settings = sqlx::query_as(
            "SELECT id, method, config, created_at, updated_at FROM meta_auth_settings WHERE id = $1",
        )
        .bind(key)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(settings)
    }

    async fn upsert_auth_settings(
        &self,
        settings: &AuthSettingsRecord,
    ) -> Result<AuthSettingsRecord, Error> {
        let stored = sqlx::query_as(
            r#"INSERT INTO meta_auth_settings (id, method, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                method = EXCLUDED.method,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            RETURNING id, method, config, created_at, updated_at"#,
        )
        .bind(settings.id.clone())
        .bind(settings.method.clone())
        .bind(settings.config.clone())
        .bind(settings.created_at)
        .bind(settings.updated_at)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(stored)
    }

    async fn physical_table_exists(&self, name: &str) -> Result<bool, Error> {
        let row = sqlx::query($repo::QUERIES.table_exists)
            .bind(name)
            .fetch_optional(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(row.is_some())
    }

    async fn physical_column_names(&self, table_name: &str) -> Result<Vec<String>, Error> {
        let rows = sqlx::query($repo::QUERIES.table_columns)
            .bind(table_name)
            .fetch_all(&self.executor)
            .await.map_err($repo::interpret_error)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err($repo::interpret_error))
            .collect()
    }

    async fn create_physical_table(
        &self,
        name: &str,
        columns: &[PhysicalColumn],
    ) -> Result<(), Error> {
        let definitions = columns
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    quote_identifier(&c.name),
                    $repo::QUERIES.physical_types.get(c.logical_type),
                    if c.required { " NOT NULL" } else { "" }
                )
            })
            .join(", ");

        self.execute_ddl(format!("CREATE TABLE {} ({definitions})", quote_identifier(name)))
            .await
    }

    async fn add_physical_column(
        &self,
        table_name: &str,
        column: &PhysicalColumn,
    ) -> Result<(), Error> {
        self.execute_ddl(format!(
            "ALTER TABLE {} ADD COLUMN {} {}{}",
            quote_identifier(table_name),
            quote_identifier(&column.name),
            $repo::QUERIES.physical_types.get(column.logical_type),
            if column.required { " NOT NULL" } else { "" }
        ))
        .await
    }

    async fn drop_physical_table(&self, name: &str) -> Result<(), Error> {
        self.execute_ddl(format!(
            "DROP TABLE IF EXISTS {}{}",
            quote_identifier(name),
            $repo::QUERIES.drop_table_suffix
        ))
        .await
    }

    async fn select_rows(&self, table_name: &str, query: &RowQuery) -> Result<Vec<RowData>, Error> {
        let mut builder: QueryBuilder<$db> = QueryBuilder::new("SELECT ");
        if query.columns.is_empty() {
            builder.push("*");
        } else {
            builder.push(Self::column_list(&query.columns));
        }
        builder.push(" FROM ");
        builder.push(quote_identifier(table_name));

        Self::push_filters(&mut builder, query.filters.clone());

        if let Some((column, descending)) = &query.order_by {
            builder.push(" ORDER BY ");
            builder.push(quote_identifier(column));
            builder.push(if *descending { " DESC" } else { " ASC" });
        }
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build()
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)?;

        rows.iter()
            .map(|row| Self::decode_row(row, &query.columns))
            .collect()
    }

    async fn insert_row(
        &self,
        table_name: &str,
        values: Vec<(String, SqlValue)>,
        returning: &[(String, LogicalType)],
    ) -> Result<RowData, Error> {
        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new(format!("INSERT INTO {}", quote_identifier(table_name)));

        if values.is_empty() {
            builder.push(" DEFAULT VALUES");
        } else {
            builder.push(" (");
            builder.push(values.iter().map(|(name, _)| quote_identifier(name)).join(", "));
            builder.push(") VALUES (");
            for (i, (_, value)) in values.into_iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                Self::push_sql_value(&mut builder, value);
            }
            builder.push(")");
        }

        if returning.is_empty() {
            builder.build().execute(&self.executor).await.map_err($repo::interpret_error)?;
            return Ok(RowData::new());
        }

        builder.push(" RETURNING ");
        builder.push(Self::column_list(returning));

        let row = builder
            .build()
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        Self::decode_row(&row, returning)
    }

    async fn update_rows(
        &self,
        table_name: &str,
        values: Vec<(String, SqlValue)>,
        filters: Vec<(String, SqlValue)>,
    ) -> Result<u64, Error> {
        if values.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new(format!("UPDATE {} SET ", quote_identifier(table_name)));
        for (i, (name, value)) in values.into_iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(quote_identifier(&name));
            builder.push(" = ");
            Self::push_sql_value(&mut builder, value);
        }
        Self::push_filters(&mut builder, filters);

        let result = builder.build().execute(&self.executor).await.map_err($repo::interpret_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_rows(
        &self,
        table_name: &str,
        filters: Vec<(String, SqlValue)>,
    ) -> Result<u64, Error> {
        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new(format!("DELETE FROM {}", quote_identifier(table_name)));
        Self::push_filters(&mut builder, filters);

        let result = builder.build().execute(&self.executor).await.map_err($repo::interpret_error)?;
        Ok(result.rows_affected())
    }
}

};
}
