//! Risk - リスク区分と承認ポリシー表
//!
//! core はペイロードの意味からリスクを判定しません。与えられた `RiskTier` を
//! `PolicyTable` で引いて「承認が必要か」「grant 照合に使うスコープ」を決めるだけです。
//!
//! `BypassPolicy` はユーザー単位で承認を省略させる設定で、テナントごとの
//! `allow_user_bypass` が false なら個別設定は無視されます。
//!
//! # 設計原則
//! - ポリシーはデータ（設定ファイルから読み込む lookup table）
//! - 状態機械やコーディネーターに分岐をハードコードしない

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;
use super::principal::{TenantId, UserId};

/// RiskTier はタスクが及ぼしうる影響の区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    ReadOnly,
    Mutating,
    Destructive,
    Privileged,
}

impl RiskTier {
    pub const ALL: [RiskTier; 4] = [
        RiskTier::ReadOnly,
        RiskTier::Mutating,
        RiskTier::Destructive,
        RiskTier::Privileged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::ReadOnly => "read-only",
            RiskTier::Mutating => "mutating",
            RiskTier::Destructive => "destructive",
            RiskTier::Privileged => "privileged",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        RiskTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
            .ok_or_else(|| ValidationError::new(format!("invalid risk tier: {s:?}")))
    }
}

/// 1 つの区分に対するポリシー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// 実行前に承認が必要か
    pub requires_approval: bool,

    /// grant 照合に使う既定スコープ（未指定なら `risk:<tier>`）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RiskTier → TierPolicy の lookup table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    tiers: BTreeMap<RiskTier, TierPolicy>,
}

impl PolicyTable {
    pub fn new(tiers: BTreeMap<RiskTier, TierPolicy>) -> Self {
        Self { tiers }
    }

    /// `threshold` 以下の区分は自動承認、それより上は承認必須
    pub fn with_auto_approve_up_to(threshold: RiskTier) -> Self {
        let tiers = RiskTier::ALL
            .into_iter()
            .map(|tier| {
                (
                    tier,
                    TierPolicy {
                        requires_approval: tier > threshold,
                        scope: None,
                    },
                )
            })
            .collect();
        Self { tiers }
    }

    /// 区分のポリシーを引く。表にない区分は受け付けない
    pub fn lookup(&self, tier: RiskTier) -> Result<&TierPolicy, ValidationError> {
        self.tiers.get(&tier).ok_or_else(|| {
            ValidationError::new(format!("risk tier {tier} is not configured in the policy table"))
        })
    }

    pub fn requires_approval(&self, tier: RiskTier) -> Result<bool, ValidationError> {
        Ok(self.lookup(tier)?.requires_approval)
    }

    /// grant 照合用スコープ。明示指定があればそれを優先する
    pub fn scope_for(
        &self,
        tier: RiskTier,
        explicit: Option<&str>,
    ) -> Result<String, ValidationError> {
        let policy = self.lookup(tier)?;
        if let Some(scope) = explicit {
            if scope.trim().is_empty() {
                return Err(ValidationError::new("scope must not be empty"));
            }
            return Ok(scope.to_string());
        }
        Ok(policy
            .scope
            .clone()
            .unwrap_or_else(|| format!("risk:{tier}")))
    }

    pub fn tiers(&self) -> impl Iterator<Item = (&RiskTier, &TierPolicy)> {
        self.tiers.iter()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::with_auto_approve_up_to(RiskTier::Mutating)
    }
}

/// 承認を省略してよい範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BypassMode {
    #[default]
    Disabled,
    /// read-only と mutating だけ
    LowRiskOnly,
    AllRisk,
}

impl BypassMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassMode::Disabled => "DISABLED",
            BypassMode::LowRiskOnly => "LOW_RISK_ONLY",
            BypassMode::AllRisk => "ALL_RISK",
        }
    }

    pub fn allows(&self, tier: RiskTier) -> bool {
        match self {
            BypassMode::Disabled => false,
            BypassMode::LowRiskOnly => tier <= RiskTier::Mutating,
            BypassMode::AllRisk => true,
        }
    }
}

impl fmt::Display for BypassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BypassMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DISABLED" => Ok(BypassMode::Disabled),
            "LOW_RISK_ONLY" => Ok(BypassMode::LowRiskOnly),
            "ALL_RISK" => Ok(BypassMode::AllRisk),
            _ => Err(ValidationError::new(format!("invalid bypass mode: {s:?}"))),
        }
    }
}

/// (tenant, user) ごとの bypass 設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPolicyOverride {
    pub tenant: TenantId,
    pub user: UserId,
    pub mode: BypassMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantBypass {
    pub allow_user_bypass: bool,
}

/// ユーザー単位の承認省略ポリシー
///
/// 実効モードはテナントの `allow_user_bypass`（なければ全体の既定値）が true のときだけ
/// 個別設定の値になり、それ以外は常に `DISABLED`。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassPolicy {
    /// テナント設定がないときの既定
    pub allow_user_bypass: bool,
    pub tenants: BTreeMap<TenantId, TenantBypass>,
    pub overrides: Vec<UserPolicyOverride>,
}

impl BypassPolicy {
    pub fn tenant_allows_user_bypass(&self, tenant: &TenantId) -> bool {
        self.tenants
            .get(tenant)
            .map_or(self.allow_user_bypass, |t| t.allow_user_bypass)
    }

    /// 個別設定そのもの（テナントの kill switch は見ない）
    pub fn configured_mode(&self, tenant: &TenantId, user: &UserId) -> BypassMode {
        self.overrides
            .iter()
            .find(|o| &o.tenant == tenant && &o.user == user)
            .map_or(BypassMode::Disabled, |o| o.mode)
    }

    pub fn effective_mode(&self, tenant: &TenantId, user: &UserId) -> BypassMode {
        if !self.tenant_allows_user_bypass(tenant) {
            return BypassMode::Disabled;
        }
        self.configured_mode(tenant, user)
    }

    /// この区分の承認を省略できるなら、その根拠になったモード
    pub fn bypass_for(&self, tenant: &TenantId, user: &UserId, tier: RiskTier) -> Option<BypassMode> {
        let mode = self.effective_mode(tenant, user);
        mode.allows(tier).then_some(mode)
    }

    /// 同じ (tenant, user) の重複は受け付けない
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::BTreeSet::new();
        for o in &self.overrides {
            if !seen.insert((&o.tenant, &o.user)) {
                return Err(ValidationError::new(format!(
                    "duplicate bypass override for {}/{}",
                    o.tenant, o.user
                )));
            }
        }
        Ok(())
    }
}
