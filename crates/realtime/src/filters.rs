use serde_json::{Map, Value};

/// データベース変更に対するフィルター条件
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseFilter {
    /// フィルター対象のカラム名
    pub column: String,
    /// 比較演算子
    pub operator: FilterOperator,
    /// 比較する値
    pub value: Value,
}

/// フィルター演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// 等しい
    Eq,
    /// 等しくない
    Neq,
    /// 含む
    In,
}

impl std::fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::In => "in",
        };
        write!(f, "{}", s)
    }
}

impl DatabaseFilter {
    /// Wire form used in the join payload, e.g. `client_id=eq.abc` or `id=in.(a,b)`.
    pub fn to_filter_string(&self) -> String {
        match self.operator {
            FilterOperator::In => {
                let values = match &self.value {
                    Value::Array(items) => items.iter().map(plain).collect::<Vec<_>>(),
                    other => vec![plain(other)],
                };
                format!("{}=in.({})", self.column, values.join(","))
            }
            op => format!("{}={}.{}", self.column, op, plain(&self.value)),
        }
    }

    /// Evaluates the filter against a changed row.
    ///
    /// A row missing the column passes: deletes only carry the primary key
    /// unless the table has full replica identity.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        let actual = match row.get(&self.column) {
            Some(value) => plain(value),
            None => return true,
        };
        match self.operator {
            FilterOperator::Eq => actual == plain(&self.value),
            FilterOperator::Neq => actual != plain(&self.value),
            FilterOperator::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| plain(v) == actual),
                other => plain(other) == actual,
            },
        }
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
