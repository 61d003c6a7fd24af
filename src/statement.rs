use crate::store::{BatchShape, OpKind, StatementSpec};

/// Turns a statement description into parameterized SQL. The placeholders must
/// follow the parameter order documented in [`crate::store`].
pub trait StatementBuilder {
    fn build(&self, table: &str, spec: &StatementSpec) -> String;
}

/// Builds calls to the server-side batch write functions.
#[derive(Debug, Clone)]
pub struct PsqlStatementBuilder {
    schema: String,
}

impl Default for PsqlStatementBuilder {
    fn default() -> Self {
        Self::new("public")
    }
}

impl PsqlStatementBuilder {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholders(types: &[&str]) -> String {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("${}::{ty}", i + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StatementBuilder for PsqlStatementBuilder {
    fn build(&self, table: &str, spec: &StatementSpec) -> String {
        let with_geometry = spec.shape == BatchShape::WithGeometry;
        let (function, types): (&str, Vec<&str>) = match spec.kind {
            OpKind::Insert => {
                let mut types = vec!["jsonb[]"];
                if with_geometry {
                    types.push("geometry[]");
                }
                ("xyz_write_insert", types)
            }
            OpKind::Update => {
                let mut types = vec!["text[]", "text[]", "jsonb[]"];
                if with_geometry {
                    types.push("geometry[]");
                }
                types.push("boolean");
                ("xyz_write_update", types)
            }
            OpKind::Delete => {
                let mut types = Vec::new();
                if spec.versioned {
                    types.push("bigint");
                }
                types.push("text[]");
                if spec.with_uuid {
                    types.push("text[]");
                }
                let function = if spec.versioned {
                    "xyz_write_soft_delete"
                } else {
                    "xyz_write_delete"
                };
                (function, types)
            }
        };
        let layer = if spec.extending { ", true" } else { "" };
        format!(
            "SELECT success, xyz_ns, err_msg FROM {function}('{}'::regclass, {}{layer})",
            self.qualified(table).replace('\'', "''"),
            placeholders(&types)
        )
    }
}

/// Number of distinct `$n` placeholders in `sql`.
pub fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut seen = std::collections::BTreeSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                seen.insert(&sql[start..end]);
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    seen.len()
}
