//! TaskType - 実行バックエンドへのルーティングキー
//!
//! core はペイロードを解釈しません。task_type は「どの Handler が
//! ペイロードを読むか」を決めるためだけに使います。
//!
//! # 命名規約
//! - `{namespace}.{domain}.{action}.v{major}`
//! - 例: `ops.shell.exec.v1`
//!
//! 規約は推奨であり、検証するのは「空でない・空白を含まない」ことだけです。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::new("task_type must not be empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(ValidationError::new(format!(
                "task_type must not contain whitespace: {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ops.shell.exec.v1", true)]
    #[case("generic", true)]
    #[case("", false)]
    #[case("ops shell", false)]
    fn validates_task_type(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(TaskType::new(input).is_ok(), ok);
    }
}
