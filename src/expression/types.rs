//! Value types and aggregation statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of value kinds an expression can produce.
///
/// Legacy names (`enum[]`, `integer`, `decimal`) are accepted when parsing and
/// normalized to their current equivalents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LiteralType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "number", alias = "integer", alias = "decimal")]
    Number,
    #[serde(rename = "enum")]
    Enum,
    #[serde(rename = "enumset", alias = "enum[]")]
    Enumset,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "datetime")]
    Datetime,
    #[serde(rename = "id")]
    Id,
    #[serde(rename = "id[]")]
    IdArray,
    #[serde(rename = "geometry")]
    Geometry,
    #[serde(rename = "text[]")]
    TextArray,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "imagelist")]
    Imagelist,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "dataurl")]
    Dataurl,
}

impl LiteralType {
    pub const ALL: [LiteralType; 15] = [
        LiteralType::Text,
        LiteralType::Number,
        LiteralType::Enum,
        LiteralType::Enumset,
        LiteralType::Boolean,
        LiteralType::Date,
        LiteralType::Datetime,
        LiteralType::Id,
        LiteralType::IdArray,
        LiteralType::Geometry,
        LiteralType::TextArray,
        LiteralType::Image,
        LiteralType::Imagelist,
        LiteralType::Json,
        LiteralType::Dataurl,
    ];

    /// Get the wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            LiteralType::Text => "text",
            LiteralType::Number => "number",
            LiteralType::Enum => "enum",
            LiteralType::Enumset => "enumset",
            LiteralType::Boolean => "boolean",
            LiteralType::Date => "date",
            LiteralType::Datetime => "datetime",
            LiteralType::Id => "id",
            LiteralType::IdArray => "id[]",
            LiteralType::Geometry => "geometry",
            LiteralType::TextArray => "text[]",
            LiteralType::Image => "image",
            LiteralType::Imagelist => "imagelist",
            LiteralType::Json => "json",
            LiteralType::Dataurl => "dataurl",
        }
    }

    /// Types whose values are JSON arrays
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            LiteralType::Enumset | LiteralType::IdArray | LiteralType::TextArray | LiteralType::Imagelist
        )
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LiteralType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" | "decimal" => return Ok(LiteralType::Number),
            "enum[]" => return Ok(LiteralType::Enumset),
            _ => {}
        }
        LiteralType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown literal type: {}", s))
    }
}

/// How an expression relates to rows of its table.
///
/// Ordered so that `max` picks the dominant status: a composite containing an
/// aggregate is aggregate, otherwise individual if any part is per-row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggrStatus {
    /// Constant, independent of rows
    Literal,
    /// One value per row
    Individual,
    /// Reduction over many rows
    Aggregate,
}

impl AggrStatus {
    /// Every status, least dominant first
    pub fn all() -> Vec<AggrStatus> {
        vec![AggrStatus::Literal, AggrStatus::Individual, AggrStatus::Aggregate]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggrStatus::Literal => "literal",
            AggrStatus::Individual => "individual",
            AggrStatus::Aggregate => "aggregate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_type_names() {
        let t: LiteralType = serde_json::from_str("\"enum[]\"").unwrap();
        assert_eq!(t, LiteralType::Enumset);
        let t: LiteralType = serde_json::from_str("\"decimal\"").unwrap();
        assert_eq!(t, LiteralType::Number);
        assert_eq!("integer".parse::<LiteralType>().unwrap(), LiteralType::Number);
        assert_eq!(serde_json::to_string(&LiteralType::IdArray).unwrap(), "\"id[]\"");
        assert!("blob".parse::<LiteralType>().is_err());
    }

    #[test]
    fn test_aggr_status_precedence() {
        let statuses = [AggrStatus::Literal, AggrStatus::Aggregate, AggrStatus::Individual];
        assert_eq!(statuses.iter().max(), Some(&AggrStatus::Aggregate));
        assert_eq!(
            [AggrStatus::Literal, AggrStatus::Individual].iter().max(),
            Some(&AggrStatus::Individual)
        );
    }
}
