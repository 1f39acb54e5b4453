//! Walking chains of join columns.

use crate::expression::LiteralType;
use crate::inference::ExprUtils;
use crate::schema::ColumnType;

/// One resolved hop of a join chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinHop {
    pub from_table: String,
    pub column: String,
    pub to_table: String,
    pub multiple: bool,
}

impl ExprUtils<'_> {
    /// Resolve each join column starting from `table`; `None` if any hop does
    /// not exist or is not followable.
    pub fn resolve_joins(&self, table: &str, joins: &[String]) -> Option<Vec<JoinHop>> {
        let mut hops = Vec::with_capacity(joins.len());
        let mut current = table.to_string();

        for join_id in joins {
            let column = self.schema().get_column(&current, join_id)?;
            let (to_table, multiple) = match column.column_type {
                ColumnType::Join => {
                    let join = column.join.as_ref()?;
                    (join.to_table.clone(), join.kind.is_multiple())
                }
                ColumnType::Literal(LiteralType::Id) => (column.id_table.clone()?, false),
                ColumnType::Literal(LiteralType::IdArray) => (column.id_table.clone()?, true),
                _ => return None,
            };
            self.schema().get_table(&to_table)?;

            hops.push(JoinHop {
                from_table: current,
                column: join_id.clone(),
                to_table: to_table.clone(),
                multiple,
            });
            current = to_table;
        }
        Some(hops)
    }

    /// Table reached by following `joins` from `table`
    pub fn follow_joins(&self, table: &str, joins: &[String]) -> Option<String> {
        let hops = self.resolve_joins(table, joins)?;
        Some(hops.last().map_or_else(|| table.to_string(), |h| h.to_table.clone()))
    }

    /// Whether any hop can yield several rows
    pub fn is_multiple_joins(&self, table: &str, joins: &[String]) -> bool {
        self.resolve_joins(table, joins)
            .is_some_and(|hops| hops.iter().any(|h| h.multiple))
    }

    /// Whether every hop resolves
    pub fn are_joins_valid(&self, table: &str, joins: &[String]) -> bool {
        self.schema().get_table(table).is_some() && self.resolve_joins(table, joins).is_some()
    }
}
