//! Filtered, paginated reads.
//!
//! The total count and the page come from the same read transaction, so
//! they always describe the same snapshot.

use crate::queries::{chat_from_row, message_from_row, CHAT_COLUMNS, MESSAGE_COLUMNS};
use crate::search::build_match_query;
use crate::{Chat, DatabaseResult, MessageRecord};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    /// Newest first.
    #[default]
    Descending,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationParams {
    pub offset: usize,
    pub limit: usize,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl PaginationParams {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            sort_order: SortOrder::default(),
        }
    }

    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = sort_order;
        self
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

/// Chat filters. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFilter {
    pub provider: Option<String>,
    pub archived: Option<bool>,
    /// Free text matched against the chat search index; a blank term
    /// matches nothing.
    pub search_term: Option<String>,
}

/// Message filters. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub chat_id: Option<String>,
    pub is_from_user: Option<bool>,
    /// Free text matched against the message search index; a blank term
    /// matches nothing.
    pub search_term: Option<String>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    /// Matches across all pages.
    pub total_count: usize,
    pub has_more: bool,
    pub next_offset: usize,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total_count: usize, offset: usize) -> Self {
        let next_offset = offset + items.len();
        Self {
            has_more: next_offset < total_count,
            next_offset,
            total_count,
            items,
        }
    }

    /// Convert every item, failing on the first error.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<PaginatedResult<U>, E> {
        Ok(PaginatedResult {
            items: self.items.into_iter().map(f).collect::<Result<Vec<_>, _>>()?,
            total_count: self.total_count,
            has_more: self.has_more,
            next_offset: self.next_offset,
        })
    }
}

/// WHERE clause with positional parameters.
#[derive(Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    values: Vec<Value>,
}

impl Conditions {
    fn push(&mut self, clause: &'static str, value: Value) {
        self.clauses.push(clause);
        self.values.push(value);
    }

    /// Full-text filter. A term with no searchable tokens matches nothing,
    /// as it does for the search queries.
    fn push_term(&mut self, clause: &'static str, term: &str) {
        match build_match_query(term) {
            Some(expr) => self.push(clause, Value::Text(expr)),
            None => self.clauses.push("0"),
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn page<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    order_column: &str,
    conditions: Conditions,
    params: &PaginationParams,
    map_row: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> DatabaseResult<PaginatedResult<T>> {
    let where_sql = conditions.sql();

    let total: i64 = conn
        .prepare_cached(&format!("SELECT COUNT(*) FROM {table} {where_sql}"))?
        .query_row(params_from_iter(conditions.values.iter()), |row| row.get(0))?;
    let total = usize::try_from(total).unwrap_or_default();

    if params.limit == 0 {
        return Ok(PaginatedResult::new(Vec::new(), total, params.offset));
    }

    let order = params.sort_order.sql();
    let mut values = conditions.values;
    values.push(Value::Integer(params.limit as i64));
    values.push(Value::Integer(params.offset as i64));

    let items = conn
        .prepare_cached(&format!(
            "SELECT {columns} FROM {table} {where_sql}
             ORDER BY {order_column} {order}, id {order}
             LIMIT ? OFFSET ?"
        ))?
        .query_map(params_from_iter(values.iter()), map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PaginatedResult::new(items, total, params.offset))
}

/// Chats matching `filter`, ordered by `updated_at`.
pub fn paginate_chats(
    conn: &Connection,
    params: &PaginationParams,
    filter: &ChatFilter,
) -> DatabaseResult<PaginatedResult<Chat>> {
    let mut conditions = Conditions::default();

    if let Some(provider) = &filter.provider {
        conditions.push("provider = ?", Value::Text(provider.clone()));
    }
    if let Some(archived) = filter.archived {
        conditions.push("is_archived = ?", Value::Integer(archived as i64));
    }
    if let Some(term) = &filter.search_term {
        conditions.push_term(
            "id IN (SELECT chat_id FROM chats_search WHERE chats_search MATCH ?)",
            term,
        );
    }

    page(conn, "chats", CHAT_COLUMNS, "updated_at", conditions, params, chat_from_row)
}

/// Messages matching `filter`, ordered by `timestamp`.
pub fn paginate_messages(
    conn: &Connection,
    params: &PaginationParams,
    filter: &MessageFilter,
) -> DatabaseResult<PaginatedResult<MessageRecord>> {
    let mut conditions = Conditions::default();

    if let Some(chat_id) = &filter.chat_id {
        conditions.push("chat_id = ?", Value::Text(chat_id.clone()));
    }
    if let Some(from_user) = filter.is_from_user {
        conditions.push("is_from_user = ?", Value::Integer(from_user as i64));
    }
    if let Some(term) = &filter.search_term {
        conditions.push_term(
            "id IN (SELECT message_id FROM messages_search WHERE messages_search MATCH ?)",
            term,
        );
    }

    page(conn, "messages", MESSAGE_COLUMNS, "timestamp", conditions, params, message_from_row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_bookkeeping() {
        let first = PaginatedResult::new(vec![1; 50], 150, 0);
        assert!(first.has_more);
        assert_eq!(first.next_offset, 50);

        let last = PaginatedResult::new(vec![1; 50], 150, 100);
        assert!(!last.has_more);
        assert_eq!(last.next_offset, 150);

        let past_end = PaginatedResult::<i32>::new(vec![], 150, 400);
        assert!(!past_end.has_more);
        assert_eq!(past_end.next_offset, 400);
    }

    #[test]
    fn try_map_keeps_counts() {
        let page = PaginatedResult::new(vec![1, 2, 3], 10, 3);
        let mapped: PaginatedResult<String> = page.try_map(|n| Ok::<_, ()>(n.to_string())).unwrap();
        assert_eq!(mapped.items, vec!["1", "2", "3"]);
        assert_eq!(mapped.total_count, 10);
        assert_eq!(mapped.next_offset, 6);
        assert!(mapped.has_more);

        let failed = PaginatedResult::new(vec![1, 2], 2, 0).try_map(|n| if n == 2 { Err("bad") } else { Ok(n) });
        assert_eq!(failed.unwrap_err(), "bad");
    }

    #[test]
    fn conditions_render() {
        let mut conditions = Conditions::default();
        assert_eq!(conditions.sql(), "");
        conditions.push("a = ?", Value::Integer(1));
        conditions.push("b = ?", Value::Integer(2));
        assert_eq!(conditions.sql(), "WHERE a = ? AND b = ?");
        assert_eq!(conditions.values.len(), 2);

        conditions.push_term("c MATCH ?", "  \t ");
        assert_eq!(conditions.sql(), "WHERE a = ? AND b = ? AND 0");
        assert_eq!(conditions.values.len(), 2);
    }

    #[test]
    fn default_params() {
        let params = PaginationParams::default();
        assert_eq!(params.offset, 0);
        assert_eq!(params.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(params.sort_order, SortOrder::Descending);
        assert_eq!(params.with_sort_order(SortOrder::Ascending).sort_order, SortOrder::Ascending);
    }
}
