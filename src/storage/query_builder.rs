// Structured SQL statement construction.
//
// One statement per `exec`-style call, built from tables, a join map, a
// recursive condition tree, projections and modifiers. Values are never
// interpolated into the statement text; every comparison allocates a
// sequential placeholder and the collected bind list travels to the driver.

use super::db::{Database, DbType, Row, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOperator {
    Equals,
    NotEquals,
    Is,
    IsNot,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    In,
    NotIn,
}

impl CompareOperator {
    fn as_sql(self) -> &'static str {
        match self {
            CompareOperator::Equals => " = ",
            CompareOperator::NotEquals => " <> ",
            CompareOperator::Is => " IS ",
            CompareOperator::IsNot => " IS NOT ",
            CompareOperator::Less => " < ",
            CompareOperator::LessOrEqual => " <= ",
            CompareOperator::Greater => " > ",
            CompareOperator::GreaterOrEqual => " >= ",
            CompareOperator::In => " IN ",
            CompareOperator::NotIn => " NOT IN ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicOperator {
    #[default]
    And,
    Or,
}

impl LogicOperator {
    fn as_sql(self) -> &'static str {
        match self {
            LogicOperator::And => " AND ",
            LogicOperator::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => " ASC",
            SortOrder::Descending => " DESC",
        }
    }
}

/// InnerJoin is more restrictive than LeftJoin; when a table is joined
/// twice the smaller (stricter) variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JoinType {
    InnerJoin,
    LeftJoin,
}

/// A node in the WHERE/HAVING condition tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Condition {
    combine_op: LogicOperator,
    sub_conditions: Vec<Condition>,
    column: String,
    compare_op: Option<CompareOperator>,
    compared_column: Option<String>,
    compared_value: Option<Value>,
    value_list: Option<Vec<Value>>,
}

impl Condition {
    pub fn new(combine_op: LogicOperator) -> Self {
        Self {
            combine_op,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sub_conditions.is_empty() && self.compare_op.is_none()
    }

    pub fn set_sub_query_mode(&mut self, op: LogicOperator) {
        self.combine_op = op;
    }

    pub fn add_value_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        value: impl Into<Value>,
    ) {
        self.sub_conditions.push(Condition {
            column: column.into(),
            compare_op: Some(op),
            compared_value: Some(value.into()),
            ..Default::default()
        });
    }

    /// IN / NOT IN over an explicit value list.
    pub fn add_value_list_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        values: Vec<Value>,
    ) {
        debug_assert!(matches!(op, CompareOperator::In | CompareOperator::NotIn));
        self.sub_conditions.push(Condition {
            column: column.into(),
            compare_op: Some(op),
            value_list: Some(values),
            ..Default::default()
        });
    }

    pub fn add_column_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        column2: impl Into<String>,
    ) {
        self.sub_conditions.push(Condition {
            column: column.into(),
            compare_op: Some(op),
            compared_column: Some(column2.into()),
            ..Default::default()
        });
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.sub_conditions.push(condition);
    }

    fn is_leaf(&self) -> bool {
        self.compare_op.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Where,
    Having,
}

/// Builds and executes one SQL statement.
pub struct QueryBuilder {
    table: String,
    query_type: QueryType,
    db_type: DbType,
    columns: Vec<String>,
    column_values: Vec<(String, Value)>,
    joined_tables: Vec<String>,
    joins: Vec<(JoinType, Condition)>,
    where_condition: Condition,
    having_condition: Condition,
    group_columns: Vec<String>,
    sort_columns: Vec<(String, SortOrder)>,
    limit: i64,
    distinct: bool,
    identification_column: String,
    bind_values: Vec<Value>,
    statement: String,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>, query_type: QueryType) -> Self {
        Self {
            table: table.into(),
            query_type,
            db_type: DbType::Sqlite,
            columns: Vec::new(),
            column_values: Vec::new(),
            joined_tables: Vec::new(),
            joins: Vec::new(),
            where_condition: Condition::default(),
            having_condition: Condition::default(),
            group_columns: Vec::new(),
            sort_columns: Vec::new(),
            limit: -1,
            distinct: false,
            identification_column: "id".to_string(),
            bind_values: Vec::new(),
            statement: String::new(),
        }
    }

    pub fn select(table: impl Into<String>) -> Self {
        Self::new(table, QueryType::Select)
    }

    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(table, QueryType::Insert)
    }

    pub fn update(table: impl Into<String>) -> Self {
        Self::new(table, QueryType::Update)
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, QueryType::Delete)
    }

    pub fn set_db_type(&mut self, db_type: DbType) {
        self.db_type = db_type;
    }

    pub fn add_join(&mut self, join_type: JoinType, table: &str, condition: Condition) {
        debug_assert!(
            (join_type == JoinType::InnerJoin
                && matches!(self.query_type, QueryType::Select | QueryType::Update))
                || (join_type == JoinType::LeftJoin && self.query_type == QueryType::Select)
        );
        if let Some(pos) = self.joined_tables.iter().position(|t| t == table) {
            // Joining the same table twice: the strictest join wins and the
            // ON conditions are merged with AND.
            let entry = &mut self.joins[pos];
            entry.0 = entry.0.min(join_type);
            entry.1.add_condition(condition);
        } else {
            self.joined_tables.push(table.to_string());
            self.joins.push((join_type, condition));
        }
    }

    pub fn add_column_join(&mut self, join_type: JoinType, table: &str, col1: &str, col2: &str) {
        let mut condition = Condition::default();
        condition.add_column_condition(col1, CompareOperator::Equals, col2);
        self.add_join(join_type, table, condition);
    }

    fn root(&mut self, condition_type: ConditionType) -> &mut Condition {
        debug_assert!(
            condition_type == ConditionType::Where || self.query_type == QueryType::Select
        );
        match condition_type {
            ConditionType::Where => &mut self.where_condition,
            ConditionType::Having => &mut self.having_condition,
        }
    }

    pub fn add_value_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        value: impl Into<Value>,
    ) {
        self.where_condition.add_value_condition(column, op, value);
    }

    pub fn add_value_list_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        values: Vec<Value>,
    ) {
        self.where_condition
            .add_value_list_condition(column, op, values);
    }

    pub fn add_column_condition(
        &mut self,
        column: impl Into<String>,
        op: CompareOperator,
        column2: impl Into<String>,
    ) {
        self.where_condition.add_column_condition(column, op, column2);
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.where_condition.add_condition(condition);
    }

    pub fn add_condition_of(&mut self, condition_type: ConditionType, condition: Condition) {
        self.root(condition_type).add_condition(condition);
    }

    pub fn set_sub_query_mode(&mut self, op: LogicOperator, condition_type: ConditionType) {
        self.root(condition_type).set_sub_query_mode(op);
    }

    pub fn add_column(&mut self, column: impl Into<String>) {
        self.columns.push(column.into());
    }

    pub fn add_columns<I, S>(&mut self, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
    }

    pub fn add_aggregation(&mut self, column: &str, aggregate: &str) {
        self.columns.push(format!("{aggregate}({column})"));
    }

    pub fn set_column_value(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.column_values.push((column.into(), value.into()));
    }

    pub fn add_sort_column(&mut self, column: impl Into<String>, order: SortOrder) {
        self.sort_columns.push((column.into(), order));
    }

    pub fn add_group_column(&mut self, column: impl Into<String>) {
        debug_assert!(self.query_type == QueryType::Select);
        self.group_columns.push(column.into());
    }

    pub fn set_distinct(&mut self, distinct: bool) {
        self.distinct = distinct;
    }

    pub fn set_limit(&mut self, limit: i64) {
        self.limit = limit;
    }

    pub fn set_identification_column(&mut self, column: impl Into<String>) {
        self.identification_column = column.into();
    }

    fn bind_value(&mut self, value: Value) -> String {
        self.bind_values.push(value);
        format!("?{}", self.bind_values.len())
    }

    fn build_condition(&mut self, condition: &Condition) -> Result<String> {
        if !condition.is_leaf() {
            let mut parts = Vec::with_capacity(condition.sub_conditions.len());
            for sub in condition.sub_conditions.clone() {
                parts.push(self.build_condition(&sub)?);
            }
            return Ok(format!(
                "( {} )",
                parts.join(condition.combine_op.as_sql())
            ));
        }

        let op = condition.compare_op.expect("leaf condition without operator");
        let mut stmt = condition.column.clone();
        stmt += op.as_sql();
        if let Some(column2) = &condition.compared_column {
            stmt += column2;
        } else if let Some(values) = &condition.value_list {
            if values.is_empty() {
                return Err(Error::Argument(format!(
                    "no values given for {op:?} condition on {}",
                    condition.column
                )));
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| self.bind_value(value.clone()))
                .collect();
            stmt += &format!("( {} )", placeholders.join(", "));
        } else if let Some(value) = &condition.compared_value {
            if value.is_null() {
                stmt += "NULL";
            } else {
                stmt += &self.bind_value(value.clone());
            }
        } else {
            stmt += "NULL";
        }
        Ok(stmt)
    }

    /// Assembles the statement text and the bind list. Exposed separately
    /// so the statement generation is testable without a database.
    pub fn build_statement(&mut self) -> Result<&str> {
        self.bind_values.clear();
        let mut statement = String::new();

        // The ON conditions of inner joins in an UPDATE are folded into the
        // WHERE part here without mutating the root condition across calls.
        let mut where_condition = self.where_condition.clone();

        match self.query_type {
            QueryType::Select => {
                statement += "SELECT ";
                if self.distinct {
                    statement += "DISTINCT ";
                }
                debug_assert!(!self.columns.is_empty(), "no columns specified");
                statement += &self.columns.join(", ");
                statement += " FROM ";
                statement += &self.table;
                for (i, table) in self.joined_tables.clone().iter().enumerate() {
                    let (join_type, condition) = self.joins[i].clone();
                    match join_type {
                        JoinType::LeftJoin => statement += " LEFT JOIN ",
                        JoinType::InnerJoin => statement += " INNER JOIN ",
                    }
                    statement += table;
                    statement += " ON ";
                    statement += &self.build_condition(&condition)?;
                }
            }
            QueryType::Insert => {
                statement += "INSERT INTO ";
                statement += &self.table;
                statement += " (";
                let mut cols = Vec::new();
                let mut vals = Vec::new();
                for (column, value) in self.column_values.clone() {
                    cols.push(column);
                    vals.push(self.bind_value(value));
                }
                statement += &cols.join(", ");
                statement += ") VALUES (";
                statement += &vals.join(", ");
                statement += ")";
                if self.db_type == DbType::PostgreSql && !self.identification_column.is_empty() {
                    statement += " RETURNING ";
                    statement += &self.identification_column;
                }
            }
            QueryType::Update => {
                // Put the ON conditions into the WHERE part of the UPDATE.
                for (join_type, condition) in self.joins.clone() {
                    debug_assert!(join_type == JoinType::InnerJoin);
                    where_condition.add_condition(condition);
                }

                statement += "UPDATE ";
                statement += &self.table;

                if self.db_type == DbType::MySql && !self.joined_tables.is_empty() {
                    // MySQL lists the joined tables directly.
                    statement += ", ";
                    statement += &self.joined_tables.join(", ");
                }

                statement += " SET ";
                debug_assert!(
                    !self.column_values.is_empty(),
                    "at least one column needs to be changed"
                );
                let mut updates = Vec::new();
                for (column, value) in self.column_values.clone() {
                    let placeholder = self.bind_value(value);
                    updates.push(format!("{column} = {placeholder}"));
                }
                statement += &updates.join(", ");

                if self.db_type == DbType::PostgreSql && !self.joined_tables.is_empty() {
                    statement += " FROM ";
                    statement += &self.joined_tables.join(" JOIN ");
                }
            }
            QueryType::Delete => {
                statement += "DELETE FROM ";
                statement += &self.table;
            }
        }

        if !where_condition.is_empty() {
            statement += " WHERE ";
            statement += &self.build_condition(&where_condition)?;
        }

        if !self.group_columns.is_empty() {
            statement += " GROUP BY ";
            statement += &self.group_columns.join(", ");
        }

        if !self.having_condition.is_empty() {
            let having = self.having_condition.clone();
            statement += " HAVING ";
            statement += &self.build_condition(&having)?;
        }

        if !self.sort_columns.is_empty() {
            debug_assert!(
                self.query_type == QueryType::Select,
                "order statements are only valid for SELECT queries"
            );
            let order: Vec<String> = self
                .sort_columns
                .iter()
                .map(|(column, order)| format!("{column}{}", order.as_sql()))
                .collect();
            statement += " ORDER BY ";
            statement += &order.join(", ");
        }

        if self.limit > 0 {
            statement += &format!(" LIMIT {}", self.limit);
        }

        self.statement = statement;
        Ok(&self.statement)
    }

    pub fn bind_values(&self) -> &[Value] {
        &self.bind_values
    }

    /// Execute an UPDATE/DELETE, returning the affected row count.
    pub fn exec(&mut self, db: &Database) -> Result<usize> {
        self.build_statement()?;
        db.execute(&self.statement, &self.bind_values)
    }

    /// Execute a SELECT, returning all rows.
    pub fn query(&mut self, db: &Database) -> Result<Vec<Row>> {
        debug_assert!(self.query_type == QueryType::Select);
        self.build_statement()?;
        db.query(&self.statement, &self.bind_values)
    }

    /// Execute an INSERT, returning the assigned id.
    pub fn exec_insert(&mut self, db: &Database) -> Result<i64> {
        debug_assert!(self.query_type == QueryType::Insert);
        self.build_statement()?;
        if self.db_type == DbType::PostgreSql {
            let rows = db.query(&self.statement, &self.bind_values)?;
            return rows
                .first()
                .and_then(|row| row.first())
                .and_then(|value| value.as_opt_i64())
                .ok_or_else(|| Error::Argument("insert returned no id".into()));
        }
        db.execute(&self.statement, &self.bind_values)?;
        Ok(db.last_insert_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(qb: &mut QueryBuilder) -> String {
        qb.build_statement().unwrap().to_string()
    }

    #[test]
    fn simple_select() {
        let mut qb = QueryBuilder::select("PimItemTable");
        qb.add_column("id");
        qb.add_column("rev");
        qb.add_value_condition("collectionId", CompareOperator::Equals, 5i64);
        assert_eq!(
            built(&mut qb),
            "SELECT id, rev FROM PimItemTable WHERE ( collectionId = ?1 )"
        );
        assert_eq!(qb.bind_values(), &[Value::Int(5)]);
    }

    #[test]
    fn select_with_joins_group_having_order_limit() {
        let mut qb = QueryBuilder::select("PartTable");
        qb.add_column("PartTable.id");
        qb.add_aggregation("PimItemTable.id", "count");
        qb.add_column_join(
            JoinType::InnerJoin,
            "PimItemTable",
            "PartTable.pimItemId",
            "PimItemTable.id",
        );
        qb.add_value_condition("PimItemTable.dirty", CompareOperator::Equals, false);
        qb.add_group_column("PartTable.id");
        let mut having = Condition::default();
        having.add_value_condition("count(PimItemTable.id)", CompareOperator::Greater, 1i64);
        qb.add_condition_of(ConditionType::Having, having);
        qb.add_sort_column("PartTable.id", SortOrder::Descending);
        qb.set_limit(10);
        assert_eq!(
            built(&mut qb),
            "SELECT PartTable.id, count(PimItemTable.id) FROM PartTable \
             INNER JOIN PimItemTable ON ( PartTable.pimItemId = PimItemTable.id ) \
             WHERE ( PimItemTable.dirty = ?1 ) \
             GROUP BY PartTable.id \
             HAVING ( ( count(PimItemTable.id) > ?2 ) ) \
             ORDER BY PartTable.id DESC LIMIT 10"
        );
    }

    #[test]
    fn double_join_keeps_strictest_and_merges_conditions() {
        let mut qb = QueryBuilder::select("a");
        qb.add_column("a.id");
        qb.add_column_join(JoinType::LeftJoin, "b", "a.id", "b.aId");
        qb.add_column_join(JoinType::InnerJoin, "b", "b.kind", "a.kind");
        assert_eq!(
            built(&mut qb),
            "SELECT a.id FROM a INNER JOIN b ON \
             ( a.id = b.aId AND ( b.kind = a.kind ) )"
        );
    }

    #[test]
    fn in_condition_binds_every_entry() {
        let mut qb = QueryBuilder::select("FlagTable");
        qb.add_column("id");
        qb.add_value_list_condition(
            "name",
            CompareOperator::In,
            vec![Value::from("a"), Value::from("b"), Value::from("c")],
        );
        assert_eq!(
            built(&mut qb),
            "SELECT id FROM FlagTable WHERE ( name IN ( ?1, ?2, ?3 ) )"
        );
        assert_eq!(qb.bind_values().len(), 3);
    }

    #[test]
    fn empty_in_list_is_an_error() {
        let mut qb = QueryBuilder::select("FlagTable");
        qb.add_column("id");
        qb.add_value_list_condition("name", CompareOperator::In, vec![]);
        assert!(qb.build_statement().is_err());
    }

    #[test]
    fn null_values_render_as_literal_null() {
        let mut qb = QueryBuilder::select("PartTable");
        qb.add_column("id");
        qb.add_value_condition("data", CompareOperator::IsNot, Value::Null);
        assert_eq!(
            built(&mut qb),
            "SELECT id FROM PartTable WHERE ( data IS NOT NULL )"
        );
        assert!(qb.bind_values().is_empty());
    }

    #[test]
    fn nested_or_conditions() {
        let mut qb = QueryBuilder::select("CollectionTable");
        qb.add_column("id");
        let mut or = Condition::new(LogicOperator::Or);
        or.add_value_condition("parentId", CompareOperator::Is, Value::Null);
        or.add_value_condition("parentId", CompareOperator::Equals, 0i64);
        qb.add_condition(or);
        qb.add_value_condition("isVirtual", CompareOperator::Equals, false);
        assert_eq!(
            built(&mut qb),
            "SELECT id FROM CollectionTable WHERE \
             ( ( parentId IS NULL OR parentId = ?1 ) AND isVirtual = ?2 )"
        );
    }

    #[test]
    fn insert_statement_per_dialect() {
        let mut qb = QueryBuilder::insert("ResourceTable");
        qb.set_column_value("name", "imap");
        assert_eq!(built(&mut qb), "INSERT INTO ResourceTable (name) VALUES (?1)");

        let mut qb = QueryBuilder::insert("ResourceTable");
        qb.set_db_type(DbType::PostgreSql);
        qb.set_column_value("name", "imap");
        assert_eq!(
            built(&mut qb),
            "INSERT INTO ResourceTable (name) VALUES (?1) RETURNING id"
        );
    }

    #[test]
    fn update_with_join_folds_on_condition_into_where() {
        let mut qb = QueryBuilder::update("PartTable");
        qb.set_column_value("data", Value::Null);
        qb.add_column_join(
            JoinType::InnerJoin,
            "PimItemTable",
            "PartTable.pimItemId",
            "PimItemTable.id",
        );
        qb.add_value_condition("PimItemTable.collectionId", CompareOperator::Equals, 7i64);
        assert_eq!(
            built(&mut qb),
            "UPDATE PartTable SET data = NULL WHERE \
             ( PimItemTable.collectionId = ?1 AND ( PartTable.pimItemId = PimItemTable.id ) )"
        );

        let mut qb2 = QueryBuilder::update("PartTable");
        qb2.set_db_type(DbType::MySql);
        qb2.set_column_value("datasize", 0i64);
        qb2.add_column_join(
            JoinType::InnerJoin,
            "PimItemTable",
            "PartTable.pimItemId",
            "PimItemTable.id",
        );
        assert_eq!(
            built(&mut qb2),
            "UPDATE PartTable, PimItemTable SET datasize = ?1 WHERE \
             ( ( PartTable.pimItemId = PimItemTable.id ) )"
        );

        let mut qb3 = QueryBuilder::update("PartTable");
        qb3.set_db_type(DbType::PostgreSql);
        qb3.set_column_value("datasize", 0i64);
        qb3.add_column_join(
            JoinType::InnerJoin,
            "PimItemTable",
            "PartTable.pimItemId",
            "PimItemTable.id",
        );
        assert_eq!(
            built(&mut qb3),
            "UPDATE PartTable SET datasize = ?1 FROM PimItemTable WHERE \
             ( ( PartTable.pimItemId = PimItemTable.id ) )"
        );
    }

    #[test]
    fn delete_statement() {
        let mut qb = QueryBuilder::delete("TagTable");
        qb.add_value_condition("id", CompareOperator::Equals, 3i64);
        assert_eq!(built(&mut qb), "DELETE FROM TagTable WHERE ( id = ?1 )");
    }

    #[test]
    fn executes_against_database() {
        let db = Database::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE FlagTable (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE)",
            &[],
        )
        .unwrap();

        let mut insert = QueryBuilder::insert("FlagTable");
        insert.set_column_value("name", "\\SEEN");
        let id = insert.exec_insert(&db).unwrap();
        assert_eq!(id, 1);

        let mut select = QueryBuilder::select("FlagTable");
        select.add_columns(["id", "name"]);
        select.add_value_condition("name", CompareOperator::Equals, "\\SEEN");
        let rows = select.query(&db).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_i64(), id);

        let mut update = QueryBuilder::update("FlagTable");
        update.set_column_value("name", "\\ANSWERED");
        update.add_value_condition("id", CompareOperator::Equals, id);
        assert_eq!(update.exec(&db).unwrap(), 1);

        let mut delete = QueryBuilder::delete("FlagTable");
        delete.add_value_condition("id", CompareOperator::Equals, id);
        assert_eq!(delete.exec(&db).unwrap(), 1);
    }
}
