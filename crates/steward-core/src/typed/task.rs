//! TypedTask trait - 型付きペイロードの定義
//!
//! task_type の文字列と Rust の型を 1 対 1 に結びつけます。
//! core は task_type を解釈しません。ExecutionBackend へのルーティングキーです。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// TypedTask は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RotateKeys {
///     service: String,
/// }
///
/// impl TypedTask for RotateKeys {
///     const TYPE: &'static str = "ops.keys.rotate.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: payload（JSON）との変換
/// - `Send + Sync + 'static`: Arc に格納してワーカー間で共有するため
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    /// - 例: `ops.keys.rotate.v1`
    const TYPE: &'static str;
}
