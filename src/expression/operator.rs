//! The operator table.
//!
//! Every operator is declared by one or more [`OpItem`] entries (overloads).
//! The table is built once on first use and never mutated afterwards; the
//! order of entries matters because callers resolving ties take the first
//! match (e.g. booleanizing an enum picks `= any`).

use crate::expression::LiteralType;
use std::sync::LazyLock;

use LiteralType::*;

/// Extra condition an operator places on its left operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LhsCond {
    /// The left operand's id-table must declare a hierarchy
    HierarchicalIdTable,
}

/// One overload of an operator
#[derive(Debug, Clone, PartialEq)]
pub struct OpItem {
    /// Operator name, as stored in `op` expressions
    pub op: &'static str,
    /// Display name
    pub name: &'static str,
    /// Label used instead of `name` when rendered as a prefix
    pub prefix_label: Option<&'static str>,
    pub result_type: LiteralType,
    /// Fixed operand types; `None` accepts any type
    pub expr_types: Vec<Option<LiteralType>>,
    /// Type of additional operands for variadic operators
    pub more_expr_type: Option<LiteralType>,
    /// Rendered as `op(a, b)` rather than `a op b`
    pub prefix: bool,
    /// Reduces many rows to one value
    pub aggr: bool,
    /// Requires the owning table to declare an ordering
    pub ordered: bool,
    /// Word placed between operands in summaries
    pub joiner: Option<&'static str>,
    pub lhs_cond: Option<LhsCond>,
}

impl OpItem {
    fn new(op: &'static str, name: &'static str, result_type: LiteralType, expr_types: &[LiteralType]) -> Self {
        Self {
            op,
            name,
            prefix_label: None,
            result_type,
            expr_types: expr_types.iter().copied().map(Some).collect(),
            more_expr_type: None,
            prefix: false,
            aggr: false,
            ordered: false,
            joiner: None,
            lhs_cond: None,
        }
    }

    fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    fn aggr(mut self) -> Self {
        self.aggr = true;
        self.prefix = true;
        self
    }

    fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    fn more(mut self, more: LiteralType) -> Self {
        self.more_expr_type = Some(more);
        self
    }

    fn any_operand(mut self) -> Self {
        self.expr_types = vec![None];
        self
    }

    fn joiner(mut self, joiner: &'static str) -> Self {
        self.joiner = Some(joiner);
        self
    }

    fn label(mut self, label: &'static str) -> Self {
        self.prefix_label = Some(label);
        self
    }

    fn lhs_cond(mut self, cond: LhsCond) -> Self {
        self.lhs_cond = Some(cond);
        self
    }

    /// Declared type of the operand at `index`
    pub fn operand_type(&self, index: usize) -> Option<LiteralType> {
        match self.expr_types.get(index) {
            Some(t) => *t,
            None => self.more_expr_type,
        }
    }

    /// Declared type of the left operand, if the entry constrains it
    pub fn lhs_type(&self) -> Option<LiteralType> {
        match self.expr_types.first() {
            Some(t) => *t,
            None => self.more_expr_type,
        }
    }
}

/// Relative-date operators and their display names
pub const RELATIVE_DATE_OPS: [(&str, &str); 15] = [
    ("thisyear", "is this year"),
    ("lastyear", "is last year"),
    ("thismonth", "is this month"),
    ("lastmonth", "is last month"),
    ("today", "is today"),
    ("yesterday", "is yesterday"),
    ("last24hours", "is in last 24 hours"),
    ("last7days", "is in last 7 days"),
    ("last30days", "is in last 30 days"),
    ("last365days", "is in last 365 days"),
    ("last3months", "is in last 3 months"),
    ("last6months", "is in last 6 months"),
    ("last12months", "is in last 12 months"),
    ("future", "is in the future"),
    ("notfuture", "is not in the future"),
];

/// Types that per-row aggregates such as `last` can carry
const AGGR_TYPES: [LiteralType; 9] = [Text, Number, Enum, Enumset, Boolean, Date, Datetime, Geometry, Id];

static OP_ITEMS: LazyLock<Vec<OpItem>> = LazyLock::new(build_op_items);

/// All operator entries, in resolution order
pub fn op_items() -> &'static [OpItem] {
    &OP_ITEMS
}

fn build_op_items() -> Vec<OpItem> {
    let mut items = Vec::new();

    // Set membership first so booleanizing picks them
    items.push(OpItem::new("= any", "is any of", Boolean, &[Text, TextArray]));
    items.push(OpItem::new("= any", "is any of", Boolean, &[Enum, Enumset]));
    items.push(OpItem::new("= any", "is any of", Boolean, &[Id, IdArray]));
    for t in [Enumset, TextArray, IdArray] {
        items.push(OpItem::new("contains", "includes all of", Boolean, &[t, t]));
        items.push(OpItem::new("intersects", "includes any of", Boolean, &[t, t]));
    }
    items.push(OpItem::new("includes", "includes", Boolean, &[Enumset, Enum]));
    items.push(OpItem::new("includes", "includes", Boolean, &[TextArray, Text]));
    items.push(OpItem::new("includes", "includes", Boolean, &[IdArray, Id]));

    for (op, name) in RELATIVE_DATE_OPS {
        items.push(OpItem::new(op, name, Boolean, &[Date]));
        items.push(OpItem::new(op, name, Boolean, &[Datetime]));
    }

    items.push(OpItem::new("between", "is between", Boolean, &[Date, Date, Date]).joiner("and"));
    items.push(OpItem::new("between", "is between", Boolean, &[Datetime, Datetime, Datetime]).joiner("and"));

    for t in [Number, Text, Enum, Date, Datetime, Boolean, Id] {
        items.push(OpItem::new("=", "is", Boolean, &[t, t]));
    }
    for t in [Number, Text, Enum, Date, Datetime, Boolean, Id] {
        items.push(OpItem::new("<>", "is not", Boolean, &[t, t]));
    }
    for (op, name) in [
        (">", "is greater than"),
        ("<", "is less than"),
        (">=", "is greater or equal to"),
        ("<=", "is less or equal to"),
    ] {
        for t in [Number, Date, Datetime] {
            items.push(OpItem::new(op, name, Boolean, &[t, t]));
        }
    }
    items.push(OpItem::new("between", "is between", Boolean, &[Number, Number, Number]).joiner("and"));

    items.push(OpItem::new("~*", "matches", Boolean, &[Text, Text]));
    items.push(OpItem::new("= false", "is false", Boolean, &[Boolean]));
    items.push(OpItem::new("is null", "is blank", Boolean, &[]).any_operand());
    items.push(OpItem::new("is not null", "is not blank", Boolean, &[]).any_operand());

    items.push(
        OpItem::new("within", "is within", Boolean, &[Id, Id]).lhs_cond(LhsCond::HierarchicalIdTable),
    );
    items.push(
        OpItem::new("within any", "is within any of", Boolean, &[Id, IdArray])
            .lhs_cond(LhsCond::HierarchicalIdTable),
    );

    items.push(OpItem::new("not", "Not", Boolean, &[Boolean]).prefix());
    items.push(OpItem::new("and", "and", Boolean, &[]).more(Boolean));
    items.push(OpItem::new("or", "or", Boolean, &[]).more(Boolean));

    items.push(OpItem::new("+", "+", Number, &[]).more(Number));
    items.push(OpItem::new("*", "*", Number, &[]).more(Number));
    items.push(OpItem::new("-", "-", Number, &[Number, Number]));
    items.push(OpItem::new("/", "/", Number, &[Number, Number]));
    items.push(OpItem::new("round", "Round", Number, &[Number]).prefix());
    items.push(OpItem::new("floor", "Floor", Number, &[Number]).prefix());
    items.push(OpItem::new("ceiling", "Ceiling", Number, &[Number]).prefix());
    items.push(OpItem::new("least", "Least of", Number, &[]).more(Number).prefix());
    items.push(OpItem::new("greatest", "Greatest of", Number, &[]).more(Number).prefix());

    for t in [Date, Datetime] {
        items.push(OpItem::new("days difference", "Days between", Number, &[t, t]).prefix().joiner("and"));
        items.push(OpItem::new("months difference", "Months between", Number, &[t, t]).prefix().joiner("and"));
        items.push(OpItem::new("years difference", "Years between", Number, &[t, t]).prefix().joiner("and"));
        items.push(OpItem::new("days since", "Days since", Number, &[t]).prefix());
        items.push(OpItem::new("month", "Month", Enum, &[t]).prefix());
        items.push(OpItem::new("yearmonth", "Year and Month", Date, &[t]).prefix());
        items.push(OpItem::new("year", "Year", Date, &[t]).prefix());
        items.push(OpItem::new("weekofmonth", "Week of month", Enum, &[t]).prefix());
        items.push(OpItem::new("dayofmonth", "Day of month", Enum, &[t]).prefix());
    }
    items.push(OpItem::new("to date", "Convert to date", Date, &[Datetime]).prefix());

    items.push(OpItem::new("latitude", "Latitude of", Number, &[Geometry]).prefix());
    items.push(OpItem::new("longitude", "Longitude of", Number, &[Geometry]).prefix());
    items.push(OpItem::new("distance", "Distance between", Number, &[Geometry, Geometry]).prefix().joiner("and"));
    items.push(OpItem::new("line length", "Length of line", Number, &[Geometry]).prefix());

    items.push(OpItem::new("length", "Number of values in", Number, &[Enumset]).prefix());
    items.push(OpItem::new("length", "Number of values in", Number, &[TextArray]).prefix());
    items.push(OpItem::new("length", "Number of values in", Number, &[IdArray]).prefix());
    items.push(OpItem::new("length", "Number of values in", Number, &[Imagelist]).prefix());

    items.push(OpItem::new("to text", "Convert to text", Text, &[Enum]).prefix());
    items.push(OpItem::new("to text", "Convert to text", Text, &[Number]).prefix());
    items.push(OpItem::new("to text", "Convert to text", Text, &[TextArray]).prefix());

    for t in AGGR_TYPES {
        items.push(OpItem::new("last", "Latest", t, &[t]).aggr().ordered());
        items.push(
            OpItem::new("last where", "Latest where", t, &[t, Boolean])
                .aggr()
                .ordered()
                .label("Latest")
                .joiner("where"),
        );
        items.push(OpItem::new("previous", "Previous", t, &[t]).aggr().ordered());
        items.push(OpItem::new("first", "First", t, &[t]).aggr().ordered());
        items.push(
            OpItem::new("first where", "First where", t, &[t, Boolean])
                .aggr()
                .ordered()
                .label("First")
                .joiner("where"),
        );
    }

    items.push(OpItem::new("sum", "Total", Number, &[Number]).aggr());
    items.push(OpItem::new("avg", "Average", Number, &[Number]).aggr());
    for t in [Number, Date, Datetime] {
        items.push(OpItem::new("min", "Minimum", t, &[t]).aggr());
        items.push(OpItem::new("max", "Maximum", t, &[t]).aggr());
    }
    for t in AGGR_TYPES {
        items.push(OpItem::new("count distinct", "Number of unique", Number, &[t]).aggr());
    }
    items.push(OpItem::new("array_agg", "Make list of", TextArray, &[Text]).aggr());
    items.push(OpItem::new("array_agg", "Make list of", IdArray, &[Id]).aggr());

    items.push(
        OpItem::new("percent where", "Percent where", Number, &[Boolean, Boolean])
            .aggr()
            .joiner("of"),
    );
    items.push(OpItem::new("count where", "Number where", Number, &[Boolean]).aggr());
    items.push(
        OpItem::new("sum where", "Total where", Number, &[Number, Boolean])
            .aggr()
            .label("Total")
            .joiner("where"),
    );

    for t in [Text, Number, Enum, Enumset, Boolean, Date, Datetime, Geometry, Id] {
        items.push(
            OpItem::new("is latest", "is latest for each", Boolean, &[t, Boolean])
                .ordered()
                .joiner("where"),
        );
    }

    // Operand-less entries last so they never win a substitution by accident
    items.push(OpItem::new("count", "Total Number", Number, &[]).aggr());
    items.push(OpItem::new("current date", "Today", Date, &[]).prefix());
    items.push(OpItem::new("current datetime", "Now", Datetime, &[]).prefix());

    items
}

/// Whether `op` is an aggregating operator
pub fn is_op_aggr(op: &str) -> bool {
    op_items().iter().any(|item| item.op == op && item.aggr)
}

/// Whether `op` is rendered in prefix form
pub fn is_op_prefix(op: &str) -> bool {
    op_items().iter().any(|item| item.op == op && item.prefix)
}

/// Whether `op` requires the owning table's ordering
pub fn is_op_ordered(op: &str) -> bool {
    op_items().iter().any(|item| item.op == op && item.ordered)
}

/// Display name of `op`
pub fn op_name(op: &str) -> Option<&'static str> {
    op_items().iter().find(|item| item.op == op).map(|item| item.name)
}

/// Whether `op` is declared at all
pub fn is_known_op(op: &str) -> bool {
    op_items().iter().any(|item| item.op == op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        let eq: Vec<_> = op_items().iter().filter(|i| i.op == "=").collect();
        assert!(eq.len() >= 6);
        assert!(eq.iter().all(|i| i.result_type == Boolean && i.expr_types.len() == 2));

        let and = op_items().iter().find(|i| i.op == "and").unwrap();
        assert!(and.expr_types.is_empty());
        assert_eq!(and.more_expr_type, Some(Boolean));
        assert_eq!(and.operand_type(5), Some(Boolean));
    }

    #[test]
    fn test_flags() {
        assert!(is_op_aggr("sum"));
        assert!(is_op_aggr("last"));
        assert!(!is_op_aggr("+"));
        assert!(is_op_ordered("last where"));
        assert!(is_op_ordered("is latest"));
        assert!(!is_op_aggr("is latest"));
        assert!(is_op_prefix("distance"));
        assert!(!is_op_prefix("="));
        assert_eq!(op_name("= any"), Some("is any of"));
        assert!(!is_known_op("frobnicate"));
    }

    #[test]
    fn test_booleanizing_order() {
        // First boolean op accepting an enum left operand must be `= any`
        let first = op_items()
            .iter()
            .find(|i| i.result_type == Boolean && i.lhs_type() == Some(Enum))
            .unwrap();
        assert_eq!(first.op, "= any");
    }
}
