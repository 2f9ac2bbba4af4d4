//! Structural table and index changes.
//!
//! Supported change types:
//! - `<createTable>` - inverse is `dropTable`
//! - `<dropTable>` - no inverse
//! - `<addColumn>` - inverse drops the added columns
//! - `<dropColumn>` - no inverse
//! - `<createIndex>` - inverse is `dropIndex`
//! - `<dropIndex>` - no inverse

use crate::change::{Change, normalize_whitespace, optional_attr, required_attr};
use crate::changelog::{ParseError, ParsedNode};
use crate::database::Dialect;

/// Parsed column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default_value: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    /// Read a `<column>` element and its optional `<constraints>` child.
    fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        let mut col = ColumnDef::new(
            required_attr(node, "name", path)?,
            optional_attr(node, "type").unwrap_or_default(),
        );
        col.default_value = optional_attr(node, "defaultValue")
            .map(|v| format!("'{}'", v.replace('\'', "''")))
            .or_else(|| optional_attr(node, "defaultValueNumeric"))
            .or_else(|| optional_attr(node, "defaultValueBoolean"))
            .or_else(|| optional_attr(node, "defaultValueComputed"));

        if let Some(constraints) = node.child("constraints") {
            col.nullable = constraints.bool_attr("nullable").unwrap_or(true);
            col.primary_key = constraints.bool_attr("primaryKey").unwrap_or(false);
            col.unique = constraints.bool_attr("unique").unwrap_or(false);
        }
        Ok(col)
    }

    fn payload(&self) -> String {
        format!(
            "{} {} nullable={} pk={} unique={} default={}",
            self.name,
            normalize_whitespace(&self.type_name),
            self.nullable,
            self.primary_key,
            self.unique,
            self.default_value.as_deref().unwrap_or("")
        )
    }

    fn sql(&self, with_primary_key: bool) -> String {
        let mut col_sql = format!("{} {}", self.name, self.type_name);

        if with_primary_key && self.primary_key {
            col_sql.push_str(" PRIMARY KEY");
        }

        if !self.nullable {
            col_sql.push_str(" NOT NULL");
        }

        if self.unique && !self.primary_key {
            col_sql.push_str(" UNIQUE");
        }

        if let Some(ref default_val) = self.default_value {
            col_sql.push_str(" DEFAULT ");
            col_sql.push_str(default_val);
        }

        col_sql
    }
}

fn columns_from_node(node: &ParsedNode, path: &str) -> Result<Vec<ColumnDef>, ParseError> {
    node.children_named("column")
        .map(|c| ColumnDef::from_node(c, path))
        .collect()
}

/// Qualify a name with an optional schema prefix.
fn qualify_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) if !s.is_empty() => format!("{}.{}", s, name),
        _ => name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl CreateTable {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: required_attr(node, "tableName", path)?,
            columns: columns_from_node(node, path)?,
        })
    }
}

impl Change for CreateTable {
    fn name(&self) -> &'static str {
        "createTable"
    }

    fn checksum_payload(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnDef::payload).collect();
        format!(
            "{}:[{}]",
            qualify_name(&self.schema_name, &self.table_name),
            columns.join(", ")
        )
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        let qualified = qualify_name(&self.schema_name, &self.table_name);
        let parts: Vec<String> = self.columns.iter().map(|c| c.sql(true)).collect();
        vec![format!("CREATE TABLE {} ({})", qualified, parts.join(", "))]
    }

    fn inverse(&self) -> Option<Vec<Box<dyn Change>>> {
        Some(vec![Box::new(DropTable {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            cascade: false,
        })])
    }

    fn describe(&self) -> String {
        format!("createTable {}", self.table_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTable {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub cascade: bool,
}

impl DropTable {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: required_attr(node, "tableName", path)?,
            cascade: node.bool_attr("cascadeConstraints").unwrap_or(false),
        })
    }
}

impl Change for DropTable {
    fn name(&self) -> &'static str {
        "dropTable"
    }

    fn checksum_payload(&self) -> String {
        format!(
            "{}:cascade={}",
            qualify_name(&self.schema_name, &self.table_name),
            self.cascade
        )
    }

    fn statements(&self, dialect: Dialect) -> Vec<String> {
        let qualified = qualify_name(&self.schema_name, &self.table_name);
        let suffix = match (self.cascade, dialect) {
            (true, Dialect::Postgres) => " CASCADE",
            (true, Dialect::Oracle) => " CASCADE CONSTRAINTS",
            _ => "",
        };
        vec![format!("DROP TABLE {}{}", qualified, suffix)]
    }

    fn describe(&self) -> String {
        format!("dropTable {}", self.table_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddColumn {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl AddColumn {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: required_attr(node, "tableName", path)?,
            columns: columns_from_node(node, path)?,
        })
    }
}

impl Change for AddColumn {
    fn name(&self) -> &'static str {
        "addColumn"
    }

    fn checksum_payload(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnDef::payload).collect();
        format!(
            "{}:[{}]",
            qualify_name(&self.schema_name, &self.table_name),
            columns.join(", ")
        )
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        let qualified = qualify_name(&self.schema_name, &self.table_name);
        self.columns
            .iter()
            .map(|col| format!("ALTER TABLE {} ADD COLUMN {}", qualified, col.sql(false)))
            .collect()
    }

    fn inverse(&self) -> Option<Vec<Box<dyn Change>>> {
        Some(
            self.columns
                .iter()
                .rev()
                .map(|col| {
                    Box::new(DropColumn {
                        schema_name: self.schema_name.clone(),
                        table_name: self.table_name.clone(),
                        column_name: col.name.clone(),
                    }) as Box<dyn Change>
                })
                .collect(),
        )
    }

    fn describe(&self) -> String {
        format!("addColumn {}", self.table_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropColumn {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub column_name: String,
}

impl DropColumn {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: required_attr(node, "tableName", path)?,
            column_name: required_attr(node, "columnName", path)?,
        })
    }
}

impl Change for DropColumn {
    fn name(&self) -> &'static str {
        "dropColumn"
    }

    fn checksum_payload(&self) -> String {
        format!(
            "{}.{}",
            qualify_name(&self.schema_name, &self.table_name),
            self.column_name
        )
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualify_name(&self.schema_name, &self.table_name),
            self.column_name
        )]
    }

    fn describe(&self) -> String {
        format!("dropColumn {}.{}", self.table_name, self.column_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIndex {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub index_name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

impl CreateIndex {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        let columns = node
            .children_named("column")
            .map(|c| required_attr(c, "name", path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: required_attr(node, "tableName", path)?,
            index_name: required_attr(node, "indexName", path)?,
            unique: node.bool_attr("unique").unwrap_or(false),
            columns,
        })
    }
}

impl Change for CreateIndex {
    fn name(&self) -> &'static str {
        "createIndex"
    }

    fn checksum_payload(&self) -> String {
        format!(
            "{} on {} unique={} ({})",
            self.index_name,
            qualify_name(&self.schema_name, &self.table_name),
            self.unique,
            self.columns.join(", ")
        )
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        let table_qualified = qualify_name(&self.schema_name, &self.table_name);
        let unique_str = if self.unique { "UNIQUE " } else { "" };
        vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            unique_str,
            self.index_name,
            table_qualified,
            self.columns.join(", ")
        )]
    }

    fn inverse(&self) -> Option<Vec<Box<dyn Change>>> {
        Some(vec![Box::new(DropIndex {
            schema_name: self.schema_name.clone(),
            table_name: Some(self.table_name.clone()),
            index_name: self.index_name.clone(),
        })])
    }

    fn describe(&self) -> String {
        format!("createIndex {}", self.index_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropIndex {
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub index_name: String,
}

impl DropIndex {
    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            schema_name: optional_attr(node, "schemaName"),
            table_name: optional_attr(node, "tableName"),
            index_name: required_attr(node, "indexName", path)?,
        })
    }
}

impl Change for DropIndex {
    fn name(&self) -> &'static str {
        "dropIndex"
    }

    fn checksum_payload(&self) -> String {
        format!(
            "{} on {}",
            qualify_name(&self.schema_name, &self.index_name),
            self.table_name.as_deref().unwrap_or("")
        )
    }

    fn statements(&self, dialect: Dialect) -> Vec<String> {
        match (dialect, &self.table_name) {
            (Dialect::MySql | Dialect::MsSql, Some(table)) => vec![format!(
                "DROP INDEX {} ON {}",
                self.index_name,
                qualify_name(&self.schema_name, table)
            )],
            _ => vec![format!(
                "DROP INDEX {}",
                qualify_name(&self.schema_name, &self.index_name)
            )],
        }
    }

    fn describe(&self) -> String {
        format!("dropIndex {}", self.index_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> ParsedNode {
        ParsedNode::new("createTable")
            .with_attr("tableName", "users")
            .with_child(
                ParsedNode::new("column")
                    .with_attr("name", "id")
                    .with_attr("type", "integer")
                    .with_child(
                        ParsedNode::new("constraints")
                            .with_attr("primaryKey", "true")
                            .with_attr("nullable", "false"),
                    ),
            )
            .with_child(
                ParsedNode::new("column")
                    .with_attr("name", "email")
                    .with_attr("type", "varchar(255)")
                    .with_child(ParsedNode::new("constraints").with_attr("unique", "true")),
            )
            .with_child(
                ParsedNode::new("column")
                    .with_attr("name", "status")
                    .with_attr("type", "text")
                    .with_attr("defaultValue", "new"),
            )
    }

    #[test]
    fn test_create_table_sql() {
        let change = CreateTable::from_node(&users_table(), "db.xml").expect("parse");
        assert_eq!(
            change.statements(Dialect::Sqlite),
            vec![
                "CREATE TABLE users (id integer PRIMARY KEY NOT NULL, email varchar(255) UNIQUE, status text DEFAULT 'new')"
            ]
        );
    }

    #[test]
    fn test_create_table_inverse_is_drop() {
        let change = CreateTable::from_node(&users_table(), "db.xml").expect("parse");
        let inverse = change.inverse().expect("inverse");
        assert_eq!(inverse.len(), 1);
        assert_eq!(inverse[0].statements(Dialect::Sqlite), vec!["DROP TABLE users"]);
    }

    #[test]
    fn test_add_column_inverse_drops_in_reverse_order() {
        let node = ParsedNode::new("addColumn")
            .with_attr("tableName", "users")
            .with_attr("schemaName", "app")
            .with_child(ParsedNode::new("column").with_attr("name", "a").with_attr("type", "int"))
            .with_child(
                ParsedNode::new("column")
                    .with_attr("name", "b")
                    .with_attr("type", "int")
                    .with_child(ParsedNode::new("constraints").with_attr("nullable", "false")),
            );
        let change = AddColumn::from_node(&node, "db.xml").expect("parse");
        assert_eq!(
            change.statements(Dialect::Sqlite),
            vec![
                "ALTER TABLE app.users ADD COLUMN a int",
                "ALTER TABLE app.users ADD COLUMN b int NOT NULL"
            ]
        );

        let inverse: Vec<String> = change
            .inverse()
            .expect("inverse")
            .iter()
            .flat_map(|c| c.statements(Dialect::Sqlite))
            .collect();
        assert_eq!(
            inverse,
            vec![
                "ALTER TABLE app.users DROP COLUMN b",
                "ALTER TABLE app.users DROP COLUMN a"
            ]
        );
    }

    #[test]
    fn test_create_index_and_dialect_specific_drop() {
        let node = ParsedNode::new("createIndex")
            .with_attr("indexName", "idx_users_email")
            .with_attr("tableName", "users")
            .with_attr("unique", "true")
            .with_child(ParsedNode::new("column").with_attr("name", "email"));
        let change = CreateIndex::from_node(&node, "db.xml").expect("parse");
        assert_eq!(
            change.statements(Dialect::Sqlite),
            vec!["CREATE UNIQUE INDEX idx_users_email ON users (email)"]
        );

        let inverse = change.inverse().expect("inverse");
        assert_eq!(
            inverse[0].statements(Dialect::MySql),
            vec!["DROP INDEX idx_users_email ON users"]
        );
        assert_eq!(
            inverse[0].statements(Dialect::Postgres),
            vec!["DROP INDEX idx_users_email"]
        );
    }

    #[test]
    fn test_drops_have_no_inverse() {
        let drop = DropTable::from_node(
            &ParsedNode::new("dropTable").with_attr("tableName", "t"),
            "db.xml",
        )
        .expect("parse");
        assert!(drop.inverse().is_none());
    }

    #[test]
    fn test_missing_table_name_is_reported() {
        let err = CreateTable::from_node(&ParsedNode::new("createTable"), "db.xml").unwrap_err();
        assert!(
            matches!(err, ParseError::MissingAttribute { ref attribute, .. } if attribute == "tableName"),
            "{}",
            err
        );
    }

    #[test]
    fn test_payload_ignores_type_spacing() {
        let a = CreateTable {
            schema_name: None,
            table_name: "t".into(),
            columns: vec![ColumnDef::new("n", "numeric(10,  2)")],
        };
        let b = CreateTable {
            schema_name: None,
            table_name: "t".into(),
            columns: vec![ColumnDef::new("n", "numeric(10, 2)")],
        };
        assert_eq!(a.checksum_payload(), b.checksum_payload());
    }
}
