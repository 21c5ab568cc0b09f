//! CRUD on websites, URL lists, queries and configurations.
//!
//! These are driven by the external command channel; the worker modules only
//! read them.

use sqlx::Row;

use crate::query::{QueryProperties, QueryType};

use super::{Database, DbError, check_identifier};

/// A website row. An empty domain marks a cross-domain website whose URLs
/// carry their own hosts.
#[derive(Debug, Clone)]
pub struct Website {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct UrlList {
    pub id: i64,
    pub website_id: i64,
    pub namespace: String,
    pub name: String,
    pub case_sensitive: bool,
}

impl Database {
    pub async fn add_website(
        &self,
        name: &str,
        namespace: &str,
        domain: &str,
    ) -> Result<i64, DbError> {
        check_identifier(namespace)?;

        let result = sqlx::query("INSERT INTO websites (name, namespace, domain) VALUES (?, ?, ?)")
            .bind(name)
            .bind(namespace)
            .bind(domain)
            .execute(self.pool())
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_website(&self, id: i64) -> Result<Option<Website>, DbError> {
        let row = sqlx::query("SELECT id, name, namespace, domain FROM websites WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|row| Website {
            id: row.get("id"),
            name: row.get("name"),
            namespace: row.get("namespace"),
            domain: row.get("domain"),
        }))
    }

    pub async fn update_website(
        &self,
        id: i64,
        name: &str,
        domain: &str,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE websites SET name = ?, domain = ? WHERE id = ?")
            .bind(name)
            .bind(domain)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete a website and cascade into its URL lists and their namespaced
    /// tables.
    pub async fn delete_website(&self, id: i64) -> Result<(), DbError> {
        for list in self.list_urllists(id).await? {
            self.delete_urllist(list.id).await?;
        }

        sqlx::query("DELETE FROM queries WHERE website_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        sqlx::query("DELETE FROM configs WHERE website_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        sqlx::query("DELETE FROM websites WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Duplicate a website: its row, queries and configurations (URL lists
    /// and their data stay behind).
    pub async fn duplicate_website(
        &self,
        id: i64,
        new_name: &str,
        new_namespace: &str,
    ) -> Result<i64, DbError> {
        let website = self
            .get_website(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("website #{id}")))?;

        let new_id = self
            .add_website(new_name, new_namespace, &website.domain)
            .await?;

        sqlx::query(
            "INSERT INTO queries (website_id, name, type, text, result_bool, result_single, \
             result_multi, result_subsets, textonly) \
             SELECT ?, name, type, text, result_bool, result_single, result_multi, \
             result_subsets, textonly FROM queries WHERE website_id = ?",
        )
        .bind(new_id)
        .bind(id)
        .execute(self.pool())
        .await?;

        sqlx::query(
            "INSERT INTO configs (website_id, module, name, body) \
             SELECT ?, module, name, body FROM configs WHERE website_id = ?",
        )
        .bind(new_id)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(new_id)
    }

    pub async fn add_urllist(
        &self,
        website_id: i64,
        namespace: &str,
        name: &str,
        case_sensitive: bool,
    ) -> Result<i64, DbError> {
        check_identifier(namespace)?;

        let result = sqlx::query(
            "INSERT INTO urllists (website_id, namespace, name, case_sensitive) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(website_id)
        .bind(namespace)
        .bind(name)
        .bind(case_sensitive as i64)
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();

        // set up the namespaced tables right away
        let ns = self.full_namespace(id).await?;

        self.init_namespace(&ns, case_sensitive).await?;

        Ok(id)
    }

    pub async fn get_urllist(&self, id: i64) -> Result<Option<UrlList>, DbError> {
        let row = sqlx::query("SELECT * FROM urllists WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|row| UrlList {
            id: row.get("id"),
            website_id: row.get("website_id"),
            namespace: row.get("namespace"),
            name: row.get("name"),
            case_sensitive: row.get::<i64, _>("case_sensitive") != 0,
        }))
    }

    pub async fn list_urllists(&self, website_id: i64) -> Result<Vec<UrlList>, DbError> {
        let rows = sqlx::query("SELECT * FROM urllists WHERE website_id = ? ORDER BY id")
            .bind(website_id)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| UrlList {
                id: row.get("id"),
                website_id: row.get("website_id"),
                namespace: row.get("namespace"),
                name: row.get("name"),
                case_sensitive: row.get::<i64, _>("case_sensitive") != 0,
            })
            .collect())
    }

    /// Duplicate a URL list: a new list row under the same website with the
    /// URL rows copied and their processing flags reset. Crawled content and
    /// locks stay behind.
    pub async fn duplicate_urllist(
        &self,
        id: i64,
        new_name: &str,
        new_namespace: &str,
    ) -> Result<i64, DbError> {
        check_identifier(new_namespace)?;

        let list = self
            .get_urllist(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("urllist #{id}")))?;

        let new_id = self
            .add_urllist(list.website_id, new_namespace, new_name, list.case_sensitive)
            .await?;

        let from_ns = self.full_namespace(id).await?;
        let into_ns = self.full_namespace(new_id).await?;

        sqlx::query(&format!(
            "INSERT INTO {into_ns}_urls (url, hash) \
             SELECT url, hash FROM {from_ns}_urls ORDER BY id"
        ))
        .execute(self.pool())
        .await?;

        Ok(new_id)
    }

    /// Rename a URL list (its namespace, and with it the table names, are
    /// fixed at creation).
    pub async fn update_urllist(&self, id: i64, name: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE urllists SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn delete_urllist(&self, id: i64) -> Result<(), DbError> {
        if let Ok(ns) = self.full_namespace(id).await {
            self.drop_namespace(&ns).await?;
        }

        sqlx::query("DELETE FROM urllists WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// The combined `<website>_<urllist>` namespace of a URL list.
    pub async fn full_namespace(&self, urllist_id: i64) -> Result<String, DbError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT w.namespace, l.namespace FROM urllists l \
             JOIN websites w ON w.id = l.website_id WHERE l.id = ?",
        )
        .bind(urllist_id)
        .fetch_optional(self.pool())
        .await?;

        let (website_ns, list_ns) =
            row.ok_or_else(|| DbError::NotFound(format!("urllist #{urllist_id}")))?;

        Ok(format!("{website_ns}_{list_ns}"))
    }

    pub async fn add_query(
        &self,
        website_id: Option<i64>,
        name: &str,
        props: &QueryProperties,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO queries (website_id, name, type, text, result_bool, result_single, \
             result_multi, result_subsets, textonly) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(website_id)
        .bind(name)
        .bind(query_type_str(props.query_type))
        .bind(&props.text)
        .bind(props.result_bool as i64)
        .bind(props.result_single as i64)
        .bind(props.result_multi as i64)
        .bind(props.result_subsets as i64)
        .bind(props.text_only as i64)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_query_props(&self, id: i64) -> Result<QueryProperties, DbError> {
        let row = sqlx::query("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("query #{id}")))?;

        let type_str: String = row.get("type");

        Ok(QueryProperties {
            query_type: parse_query_type(&type_str)
                .ok_or_else(|| DbError::NotFound(format!("query type {type_str:?}")))?,
            text: row.get("text"),
            result_bool: row.get::<i64, _>("result_bool") != 0,
            result_single: row.get::<i64, _>("result_single") != 0,
            result_multi: row.get::<i64, _>("result_multi") != 0,
            result_subsets: row.get::<i64, _>("result_subsets") != 0,
            text_only: row.get::<i64, _>("textonly") != 0,
        })
    }

    /// Duplicate a single query under a new name; returns the new id.
    pub async fn duplicate_query(&self, id: i64, new_name: &str) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO queries (website_id, name, type, text, result_bool, result_single, \
             result_multi, result_subsets, textonly) \
             SELECT website_id, ?, type, text, result_bool, result_single, result_multi, \
             result_subsets, textonly FROM queries WHERE id = ?",
        )
        .bind(new_name)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("query #{id}")));
        }

        Ok(result.last_insert_rowid())
    }

    /// Replace a stored query definition. Workers compile queries at
    /// initialization, so running threads keep their old compilation until
    /// restarted.
    pub async fn update_query(
        &self,
        id: i64,
        name: &str,
        props: &QueryProperties,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE queries SET name = ?, type = ?, text = ?, result_bool = ?, \
             result_single = ?, result_multi = ?, result_subsets = ?, textonly = ? \
             WHERE id = ?",
        )
        .bind(name)
        .bind(query_type_str(props.query_type))
        .bind(&props.text)
        .bind(props.result_bool as i64)
        .bind(props.result_single as i64)
        .bind(props.result_multi as i64)
        .bind(props.result_subsets as i64)
        .bind(props.text_only as i64)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn delete_query(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM queries WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn add_config(
        &self,
        website_id: Option<i64>,
        module: &str,
        name: &str,
        body: &str,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO configs (website_id, module, name, body) VALUES (?, ?, ?, ?)",
        )
        .bind(website_id)
        .bind(module)
        .bind(name)
        .bind(body)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_config_body(&self, id: i64) -> Result<String, DbError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM configs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(|(body,)| body)
            .ok_or_else(|| DbError::NotFound(format!("config #{id}")))
    }

    /// Duplicate a single configuration under a new name; returns the new
    /// id.
    pub async fn duplicate_config(&self, id: i64, new_name: &str) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO configs (website_id, module, name, body) \
             SELECT website_id, module, ?, body FROM configs WHERE id = ?",
        )
        .bind(new_name)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("config #{id}")));
        }

        Ok(result.last_insert_rowid())
    }

    pub async fn update_config(&self, id: i64, body: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE configs SET body = ? WHERE id = ?")
            .bind(body)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn delete_config(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM configs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}

fn query_type_str(query_type: QueryType) -> &'static str {
    match query_type {
        QueryType::RegEx => "regex",
        QueryType::XPath => "xpath",
        QueryType::JsonPointer => "jsonpointer",
        QueryType::JsonPath => "jsonpath",
    }
}

fn parse_query_type(value: &str) -> Option<QueryType> {
    match value {
        "regex" => Some(QueryType::RegEx),
        "xpath" => Some(QueryType::XPath),
        "jsonpointer" => Some(QueryType::JsonPointer),
        "jsonpath" => Some(QueryType::JsonPath),
        _ => None,
    }
}
