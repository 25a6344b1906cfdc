// Database schema description and initializer.
//
// The schema is declared as static table descriptions; at startup the
// initializer compares them against the live database, creates whatever is
// missing and applies linear migration scripts keyed by the integer in
// SchemaVersionTable.

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::db::{ColumnType, Database, DbType, Value};

/// Schema revision produced by a fresh initialization.
pub const SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub allow_null: bool,
    pub unique: bool,
    pub default: Option<&'static str>,
    /// Referenced table for foreign keys, always by its id column.
    pub references: Option<&'static str>,
    pub cascade_delete: bool,
}

impl ColumnDescription {
    const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            primary_key: false,
            allow_null: true,
            unique: false,
            default: None,
            references: None,
            cascade_delete: false,
        }
    }

    const fn primary(mut self) -> Self {
        self.primary_key = true;
        self.allow_null = false;
        self
    }

    const fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    const fn default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    const fn references(mut self, table: &'static str) -> Self {
        self.references = Some(table);
        self
    }

    const fn cascade(mut self) -> Self {
        self.cascade_delete = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct IndexDescription {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct TableDescription {
    pub name: &'static str,
    pub columns: Vec<ColumnDescription>,
    pub indexes: Vec<IndexDescription>,
}

fn id_column() -> ColumnDescription {
    ColumnDescription::new("id", ColumnType::Int64).primary()
}

/// The full relational layout, one schema per user.
pub fn schema() -> Vec<TableDescription> {
    use ColumnType::*;
    vec![
        TableDescription {
            name: "SchemaVersionTable",
            columns: vec![ColumnDescription::new("version", Int32).not_null().default("0")],
            indexes: vec![],
        },
        TableDescription {
            name: "ResourceTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("name", Text).not_null().unique(),
                ColumnDescription::new("displayName", Text),
                ColumnDescription::new("capabilities", Text),
                ColumnDescription::new("isVirtual", Bool).default("0"),
            ],
            indexes: vec![],
        },
        TableDescription {
            name: "CollectionTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("remoteId", Text),
                ColumnDescription::new("remoteRevision", Text),
                ColumnDescription::new("name", Text).not_null(),
                ColumnDescription::new("parentId", Int64).references("CollectionTable"),
                ColumnDescription::new("resourceId", Int64)
                    .not_null()
                    .references("ResourceTable"),
                ColumnDescription::new("enabled", Bool).not_null().default("1"),
                ColumnDescription::new("referenced", Bool).not_null().default("0"),
                ColumnDescription::new("displayPref", Int32).not_null().default("2"),
                ColumnDescription::new("syncPref", Int32).not_null().default("2"),
                ColumnDescription::new("indexPref", Int32).not_null().default("2"),
                ColumnDescription::new("cachePolicyInherit", Bool).not_null().default("1"),
                ColumnDescription::new("cachePolicyLocalParts", Text),
                ColumnDescription::new("cachePolicyCacheTimeout", Int32)
                    .not_null()
                    .default("-1"),
                ColumnDescription::new("cachePolicySyncOnDemand", Bool)
                    .not_null()
                    .default("0"),
                ColumnDescription::new("queryString", Text),
                ColumnDescription::new("queryLanguage", Text),
                ColumnDescription::new("isVirtual", Bool).not_null().default("0"),
            ],
            indexes: vec![
                IndexDescription {
                    name: "CollectionTable_parentIndex",
                    columns: &["parentId"],
                    unique: false,
                },
                IndexDescription {
                    name: "CollectionTable_parentAndNameIndex",
                    columns: &["parentId", "name"],
                    unique: false,
                },
                IndexDescription {
                    name: "CollectionTable_resourceIndex",
                    columns: &["resourceId"],
                    unique: false,
                },
            ],
        },
        TableDescription {
            name: "MimeTypeTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("name", Text).not_null().unique(),
            ],
            indexes: vec![],
        },
        TableDescription {
            name: "PimItemTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("rev", Int32).not_null().default("0"),
                ColumnDescription::new("remoteId", Text),
                ColumnDescription::new("remoteRevision", Text),
                ColumnDescription::new("gid", Text),
                ColumnDescription::new("collectionId", Int64)
                    .not_null()
                    .references("CollectionTable"),
                ColumnDescription::new("mimeTypeId", Int64)
                    .not_null()
                    .references("MimeTypeTable"),
                ColumnDescription::new("datetime", DateTime),
                ColumnDescription::new("atime", DateTime),
                ColumnDescription::new("size", Int64).not_null().default("0"),
                ColumnDescription::new("dirty", Bool).not_null().default("0"),
            ],
            indexes: vec![
                IndexDescription {
                    name: "PimItemTable_collectionIndex",
                    columns: &["collectionId"],
                    unique: false,
                },
                IndexDescription {
                    name: "PimItemTable_collectionAndRidIndex",
                    columns: &["collectionId", "remoteId"],
                    unique: false,
                },
                IndexDescription {
                    name: "PimItemTable_gidIndex",
                    columns: &["gid"],
                    unique: false,
                },
            ],
        },
        TableDescription {
            name: "PartTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("pimItemId", Int64)
                    .not_null()
                    .references("PimItemTable"),
                ColumnDescription::new("name", Text).not_null(),
                ColumnDescription::new("data", Blob),
                ColumnDescription::new("datasize", Int64).not_null().default("0"),
                ColumnDescription::new("version", Int32).not_null().default("0"),
                ColumnDescription::new("external", Bool).not_null().default("0"),
            ],
            indexes: vec![IndexDescription {
                name: "PartTable_pimItemIdNameIndex",
                columns: &["pimItemId", "name"],
                unique: true,
            }],
        },
        TableDescription {
            name: "FlagTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("name", Text).not_null().unique(),
            ],
            indexes: vec![],
        },
        TableDescription {
            name: "TagTypeTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("name", Text).not_null().unique(),
            ],
            indexes: vec![],
        },
        TableDescription {
            name: "TagTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("gid", Text).not_null().unique(),
                ColumnDescription::new("typeId", Int64)
                    .not_null()
                    .references("TagTypeTable"),
                ColumnDescription::new("remoteId", Text),
            ],
            indexes: vec![],
        },
        TableDescription {
            name: "RelationTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("leftId", Int64)
                    .not_null()
                    .references("PimItemTable")
                    .cascade(),
                ColumnDescription::new("rightId", Int64)
                    .not_null()
                    .references("PimItemTable")
                    .cascade(),
                ColumnDescription::new("type", Text).not_null(),
                ColumnDescription::new("remoteId", Text),
            ],
            indexes: vec![IndexDescription {
                name: "RelationTable_leftRightTypeIndex",
                columns: &["leftId", "rightId", "type"],
                unique: true,
            }],
        },
        TableDescription {
            name: "CollectionAttributeTable",
            columns: vec![
                id_column(),
                ColumnDescription::new("collectionId", Int64)
                    .not_null()
                    .references("CollectionTable")
                    .cascade(),
                ColumnDescription::new("type", Blob).not_null(),
                ColumnDescription::new("value", Blob),
            ],
            indexes: vec![IndexDescription {
                name: "CollectionAttributeTable_collectionTypeIndex",
                columns: &["collectionId", "type"],
                unique: true,
            }],
        },
        TableDescription {
            name: "PimItemFlagRelation",
            columns: vec![
                ColumnDescription::new("PimItem_id", Int64)
                    .not_null()
                    .references("PimItemTable")
                    .cascade(),
                ColumnDescription::new("Flag_id", Int64)
                    .not_null()
                    .references("FlagTable")
                    .cascade(),
            ],
            indexes: vec![IndexDescription {
                name: "PimItemFlagRelation_uniqueIndex",
                columns: &["PimItem_id", "Flag_id"],
                unique: true,
            }],
        },
        TableDescription {
            name: "PimItemTagRelation",
            columns: vec![
                ColumnDescription::new("PimItem_id", Int64)
                    .not_null()
                    .references("PimItemTable")
                    .cascade(),
                ColumnDescription::new("Tag_id", Int64)
                    .not_null()
                    .references("TagTable")
                    .cascade(),
            ],
            indexes: vec![IndexDescription {
                name: "PimItemTagRelation_uniqueIndex",
                columns: &["PimItem_id", "Tag_id"],
                unique: true,
            }],
        },
        TableDescription {
            name: "CollectionPimItemRelation",
            columns: vec![
                ColumnDescription::new("Collection_id", Int64)
                    .not_null()
                    .references("CollectionTable")
                    .cascade(),
                ColumnDescription::new("PimItem_id", Int64)
                    .not_null()
                    .references("PimItemTable")
                    .cascade(),
            ],
            indexes: vec![IndexDescription {
                name: "CollectionPimItemRelation_uniqueIndex",
                columns: &["Collection_id", "PimItem_id"],
                unique: true,
            }],
        },
        TableDescription {
            name: "CollectionMimeTypeRelation",
            columns: vec![
                ColumnDescription::new("Collection_id", Int64)
                    .not_null()
                    .references("CollectionTable")
                    .cascade(),
                ColumnDescription::new("MimeType_id", Int64)
                    .not_null()
                    .references("MimeTypeTable")
                    .cascade(),
            ],
            indexes: vec![IndexDescription {
                name: "CollectionMimeTypeRelation_uniqueIndex",
                columns: &["Collection_id", "MimeType_id"],
                unique: true,
            }],
        },
    ]
}

/// Linear migration scripts. Each entry upgrades the schema to the given
/// version and runs only when the stored version is smaller.
fn migrations() -> Vec<(i32, &'static str)> {
    vec![
        // v2: global identifier lookup on items
        (
            2,
            "CREATE INDEX IF NOT EXISTS PimItemTable_gidIndex ON PimItemTable (gid)",
        ),
    ]
}

/// Compares the live database against the schema description, creates
/// missing objects and applies pending migrations.
pub struct DbInitializer<'a> {
    db: &'a Database,
}

impl<'a> DbInitializer<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn run(&self) -> Result<()> {
        let fresh = !self.db.has_table("SchemaVersionTable")?;
        for table in schema() {
            self.init_table(&table)?;
        }
        if fresh {
            self.db
                .execute(
                    "INSERT INTO SchemaVersionTable (version) VALUES (?1)",
                    &[Value::from(SCHEMA_VERSION)],
                )
                .context("Failed to seed schema version")?;
            info!(version = SCHEMA_VERSION, "initialized fresh database schema");
        } else {
            self.apply_migrations()?;
        }
        Ok(())
    }

    fn init_table(&self, table: &TableDescription) -> Result<()> {
        if !self.db.has_table(table.name)? {
            let sql = create_table_statement(table, self.db.db_type());
            debug!(table = table.name, "creating table");
            self.db
                .execute(&sql, &[])
                .with_context(|| format!("Failed to create table {}", table.name))?;
        } else {
            // Add columns the description has but the table lacks.
            let existing = self.db.table_columns(table.name)?;
            for column in &table.columns {
                if !existing.iter().any(|c| c == column.name) {
                    let sql = format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        table.name,
                        column_definition(column, self.db.db_type())
                    );
                    debug!(table = table.name, column = column.name, "adding column");
                    self.db.execute(&sql, &[]).with_context(|| {
                        format!("Failed to add column {}.{}", table.name, column.name)
                    })?;
                }
            }
        }
        for index in &table.indexes {
            if !self.db.has_index(table.name, index.name)? {
                let unique = if index.unique { "UNIQUE " } else { "" };
                let sql = format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    unique,
                    index.name,
                    table.name,
                    index.columns.join(", ")
                );
                debug!(table = table.name, index = index.name, "creating index");
                self.db
                    .execute(&sql, &[])
                    .with_context(|| format!("Failed to create index {}", index.name))?;
            }
        }
        Ok(())
    }

    fn current_version(&self) -> Result<i32> {
        let rows = self
            .db
            .query("SELECT version FROM SchemaVersionTable", &[])
            .context("Failed to read schema version")?;
        match rows.first() {
            Some(row) => Ok(row[0].as_i64() as i32),
            None => {
                self.db
                    .execute("INSERT INTO SchemaVersionTable (version) VALUES (0)", &[])?;
                Ok(0)
            }
        }
    }

    fn apply_migrations(&self) -> Result<()> {
        let mut version = self.current_version()?;
        if version > SCHEMA_VERSION {
            bail!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}; refusing to run"
            );
        }
        for (target, script) in migrations() {
            if version >= target {
                continue;
            }
            info!(from = version, to = target, "applying schema migration");
            self.db
                .execute(script, &[])
                .with_context(|| format!("Migration to schema version {target} failed"))?;
            self.db
                .execute(
                    "UPDATE SchemaVersionTable SET version = ?1",
                    &[Value::from(target)],
                )
                .context("Failed to record schema version")?;
            version = target;
        }
        Ok(())
    }
}

fn column_definition(column: &ColumnDescription, db_type: DbType) -> String {
    let mut def = format!("{} ", column.name);
    if column.primary_key {
        def += "INTEGER ";
        def += db_type.autoincrement_clause();
        return def;
    }
    def += db_type.sql_type(column.column_type);
    if !column.allow_null {
        def += " NOT NULL";
    }
    if column.unique {
        def += " UNIQUE";
    }
    if let Some(default) = column.default {
        def += &format!(" DEFAULT {default}");
    }
    if let Some(referenced) = column.references {
        def += &format!(" REFERENCES {referenced} (id)");
        if column.cascade_delete {
            def += " ON DELETE CASCADE";
        }
    }
    def
}

fn create_table_statement(table: &TableDescription, db_type: DbType) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| column_definition(column, db_type))
        .collect();
    format!("CREATE TABLE {} ({})", table.name, columns.join(", "))
}
