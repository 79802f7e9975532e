// phantom-dspm-core/src/compliance.rs
// Deterministic encryption compliance scoring. No side effects, no I/O:
// the same profile always produces the same score.

use serde::{Deserialize, Serialize};

use crate::model::{EncryptionStatus, Finding, FindingSeverity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyManager {
    Aws,
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Enabled,
    Disabled,
    PendingDeletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub enabled: bool,
    pub rotation_enabled: bool,
    pub manager: KeyManager,
    pub allows_public_access: bool,
    pub state: KeyState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitSettings {
    pub tls_enabled: bool,
    pub tls_version: Option<String>,
    pub perfect_forward_secrecy: bool,
    pub certificate_present: bool,
}

/// The transient composite the scorer consumes: an asset's encryption
/// status joined with its resolved key record and transit settings. Never
/// persisted; assembled per scoring request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionProfile {
    pub encryption_status: EncryptionStatus,
    pub key_rotation_enabled: bool,
    pub key: Option<KeyRecord>,
    pub transit: Option<TransitSettings>,
}

/// Per-sub-score weights for the final weighted total. Defaults to
/// 0.4/0.3/0.3 as in the scoring design; configurable for tenants that
/// weight in-transit or key management differently.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub at_rest: f64,
    pub in_transit: f64,
    pub key_mgmt: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            at_rest: 0.4,
            in_transit: 0.3,
            key_mgmt: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    fn from_score(score: u32) -> Self {
        match score {
            90..=u32::MAX => Grade::A,
            80..=89 => Grade::B,
            70..=79 => Grade::C,
            60..=69 => Grade::D,
            _ => Grade::F,
        }
    }
}

/// A finding the scorer wants persisted, pre-`Finding::new` so the caller
/// can supply `account_id`/`asset_id` without the scorer knowing about
/// either.
#[derive(Debug, Clone)]
pub struct ComplianceFindingDraft {
    pub finding_type: &'static str,
    pub title: &'static str,
    pub description: String,
    pub severity: FindingSeverity,
}

impl ComplianceFindingDraft {
    pub fn into_finding(self, account_id: uuid::Uuid, asset_id: Option<uuid::Uuid>) -> Finding {
        Finding::new(
            account_id,
            asset_id,
            self.finding_type,
            self.title,
            self.description,
            self.severity,
            serde_json::json!({}),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ComplianceReport {
    pub at_rest_score: u32,
    pub in_transit_score: u32,
    pub key_mgmt_score: u32,
    pub total_score: u32,
    pub grade: Grade,
    pub findings: Vec<ComplianceFindingDraft>,
    pub recommendations: Vec<String>,
}

/// Scores an encryption profile against the three sub-scores and rolls
/// them into a weighted total and letter grade. Pure function: no I/O, no
/// mutation, no randomness.
pub fn score(profile: &EncryptionProfile, weights: &ScoringWeights) -> ComplianceReport {
    let mut findings = Vec::new();
    let mut recommendations = Vec::new();

    let at_rest = score_at_rest(profile, &mut findings, &mut recommendations);
    let in_transit = score_in_transit(profile, &mut findings, &mut recommendations);
    let key_mgmt = score_key_mgmt(profile, &mut findings, &mut recommendations);

    let total = (weights.at_rest * at_rest as f64 + weights.in_transit * in_transit as f64 + weights.key_mgmt * key_mgmt as f64).round() as u32;

    ComplianceReport {
        at_rest_score: at_rest,
        in_transit_score: in_transit,
        key_mgmt_score: key_mgmt,
        total_score: total,
        grade: Grade::from_score(total),
        findings,
        recommendations,
    }
}

fn score_at_rest(profile: &EncryptionProfile, findings: &mut Vec<ComplianceFindingDraft>, recommendations: &mut Vec<String>) -> u32 {
    if profile.encryption_status == EncryptionStatus::None {
        findings.push(ComplianceFindingDraft {
            finding_type: "UNENCRYPTED_STORAGE",
            title: "Storage is not encrypted at rest",
            description: "The asset has no at-rest encryption configured.".into(),
            severity: FindingSeverity::High,
        });
        recommendations.push("Enable at-rest encryption for this asset.".into());
        return 0;
    }

    let mut score: i64 = 40;
    if matches!(profile.encryption_status, EncryptionStatus::SseKms | EncryptionStatus::Cmk) {
        score += 30;
    }
    if profile.encryption_status == EncryptionStatus::Cmk {
        score += 20;
    }
    if profile.key_rotation_enabled {
        score += 10;
    } else {
        findings.push(ComplianceFindingDraft {
            finding_type: "KEY_ROTATION_DISABLED",
            title: "Encryption key rotation is disabled",
            description: "Automatic key rotation is not enabled for this asset's key.".into(),
            severity: FindingSeverity::Medium,
        });
        recommendations.push("Enable automatic key rotation.".into());
    }
    score.clamp(0, 100) as u32
}

fn score_in_transit(profile: &EncryptionProfile, findings: &mut Vec<ComplianceFindingDraft>, recommendations: &mut Vec<String>) -> u32 {
    let transit = match &profile.transit {
        None => return 80,
        Some(t) => t,
    };

    if !transit.tls_enabled {
        findings.push(ComplianceFindingDraft {
            finding_type: "TRANSIT_ENCRYPTION_DISABLED",
            title: "Transit encryption is disabled",
            description: "TLS is not enabled for data in transit to this asset.".into(),
            severity: FindingSeverity::Critical,
        });
        recommendations.push("Enable TLS for all connections to this asset.".into());
        return 0;
    }

    let mut score: i64 = 50;
    let tls_1_2_or_higher = tls_version_at_least(transit.tls_version.as_deref(), (1, 2));
    let tls_1_3 = tls_version_at_least(transit.tls_version.as_deref(), (1, 3));

    if tls_1_2_or_higher {
        score += 25;
    } else {
        findings.push(ComplianceFindingDraft {
            finding_type: "TLS_OUTDATED",
            title: "TLS version is outdated",
            description: format!("Negotiated TLS version {:?} is below 1.2.", transit.tls_version),
            severity: FindingSeverity::Medium,
        });
        recommendations.push("Upgrade to TLS 1.2 or later.".into());
    }
    if tls_1_3 {
        score += 10;
    }
    if transit.perfect_forward_secrecy {
        score += 10;
    }
    if transit.certificate_present {
        score += 5;
    }
    score.clamp(0, 100) as u32
}

fn score_key_mgmt(profile: &EncryptionProfile, findings: &mut Vec<ComplianceFindingDraft>, recommendations: &mut Vec<String>) -> u32 {
    if profile.encryption_status == EncryptionStatus::None {
        return 0;
    }

    let key = match &profile.key {
        None => {
            return if profile.encryption_status == EncryptionStatus::SseKms { 60 } else { 50 };
        }
        Some(k) => k,
    };

    if !key.enabled {
        findings.push(ComplianceFindingDraft {
            finding_type: "KEY_DISABLED",
            title: "Encryption key is disabled",
            description: "The key backing this asset's encryption is disabled.".into(),
            severity: FindingSeverity::High,
        });
        return 0;
    }

    let mut score: i64 = 30;
    if key.rotation_enabled {
        score += 25;
    }
    if key.manager == KeyManager::Customer {
        score += 20;
    }
    if !key.allows_public_access {
        score += 15;
    } else {
        findings.push(ComplianceFindingDraft {
            finding_type: "KEY_POLICY_OVERPERMISSIVE",
            title: "Key policy allows public access",
            description: "The key policy grants access that is not scoped to trusted principals.".into(),
            severity: FindingSeverity::Critical,
        });
        recommendations.push("Restrict the key policy to named principals.".into());
    }
    if key.state != KeyState::PendingDeletion {
        score += 10;
    } else {
        findings.push(ComplianceFindingDraft {
            finding_type: "KEY_PENDING_DELETION",
            title: "Encryption key is pending deletion",
            description: "The key backing this asset is scheduled for deletion.".into(),
            severity: FindingSeverity::High,
        });
        recommendations.push("Cancel key deletion or rotate to a new key before it is destroyed.".into());
    }
    score.clamp(0, 100) as u32
}

fn tls_version_at_least(version: Option<&str>, floor: (u32, u32)) -> bool {
    let Some(version) = version else { return false };
    let digits: String = version.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let mut parts = digits.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= floor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fully_compliant_profile() -> EncryptionProfile {
        EncryptionProfile {
            encryption_status: EncryptionStatus::Cmk,
            key_rotation_enabled: true,
            key: Some(KeyRecord {
                enabled: true,
                rotation_enabled: true,
                manager: KeyManager::Customer,
                allows_public_access: false,
                state: KeyState::Enabled,
            }),
            transit: Some(TransitSettings {
                tls_enabled: true,
                tls_version: Some("TLSv1.3".into()),
                perfect_forward_secrecy: true,
                certificate_present: true,
            }),
        }
    }

    #[test]
    fn fully_compliant_profile_scores_a_with_no_critical_findings() {
        let report = score(&fully_compliant_profile(), &ScoringWeights::default());
        assert!(report.total_score >= 90, "expected >= 90, got {}", report.total_score);
        assert_eq!(report.grade, Grade::A);
        assert!(!report.findings.iter().any(|f| f.severity == FindingSeverity::Critical));
    }

    #[test]
    fn disabling_tls_drops_in_transit_to_zero_and_caps_the_grade_at_c() {
        // at_rest and key_mgmt stay at 100; with the default 0.4/0.3/0.3
        // weights, zeroing only the 0.3-weighted in-transit score floors
        // the total at 0.4*100 + 0.3*0 + 0.3*100 = 70, which is a C, not
        // an F -- see DESIGN.md's Open Question resolutions.
        let mut profile = fully_compliant_profile();
        profile.transit.as_mut().unwrap().tls_enabled = false;
        let report = score(&profile, &ScoringWeights::default());
        assert_eq!(report.in_transit_score, 0);
        assert_eq!(report.total_score, 70);
        assert_eq!(report.grade, Grade::C);
        assert!(report
            .findings
            .iter()
            .any(|f| f.finding_type == "TRANSIT_ENCRYPTION_DISABLED" && f.severity == FindingSeverity::Critical));
    }

    #[test]
    fn unencrypted_storage_scores_zero_at_rest_and_key_mgmt() {
        let profile = EncryptionProfile {
            encryption_status: EncryptionStatus::None,
            key_rotation_enabled: false,
            key: None,
            transit: None,
        };
        let report = score(&profile, &ScoringWeights::default());
        assert_eq!(report.at_rest_score, 0);
        assert_eq!(report.key_mgmt_score, 0);
        assert!(report.findings.iter().any(|f| f.finding_type == "UNENCRYPTED_STORAGE"));
    }

    #[test]
    fn missing_transit_info_defaults_to_eighty() {
        let mut profile = fully_compliant_profile();
        profile.transit = None;
        let report = score(&profile, &ScoringWeights::default());
        assert_eq!(report.in_transit_score, 80);
    }
}
