// src/core/mdb.rs

//! The machine database: the authoritative desired-state feed the Herd
//! ingests on a timer. `Machine` is the per-host record; `Mdb` is a
//! hostname-sorted snapshot of all of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single machine's desired state, as published by an MDB source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub required_image: String,
    #[serde(default)]
    pub planned_image: String,
    #[serde(default)]
    pub disable_updates: bool,
    #[serde(default)]
    pub owner_group: String,
    #[serde(default)]
    pub aws_metadata: Option<AwsMetadata>,
}

/// Opaque AWS tags and identity attached to a machine, when the MDB source
/// is an AWS target rather than a static file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AwsMetadata {
    pub account_id: String,
    pub account_name: String,
    pub instance_id: String,
    pub region: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A snapshot of the fleet's desired state, sorted by hostname. The Herd
/// treats this sort order as load-bearing: it is copied directly into
/// `subs_by_index` during ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mdb {
    pub machines: Vec<Machine>,
}

impl Mdb {
    /// Sorts `machines` by hostname in place, establishing the invariant
    /// the rest of the Herd relies on.
    pub fn sorted(mut machines: Vec<Machine>) -> Self {
        machines.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Mdb { machines }
    }
}

/// An external, periodically-polled feed of `Mdb` snapshots. Implementations
/// are the Herd's only contract with however machine inventory is actually
/// sourced (a static file, an AWS account scan, a CMDB query, ...).
#[async_trait::async_trait]
pub trait MdbSource: Send + Sync {
    async fn next(&mut self) -> anyhow::Result<Mdb>;
}

/// Polls a JSON file on disk containing `{"machines": [...]}` every
/// `interval`. The simplest possible MDB source, used for local testing
/// and for deployments where a config-management tool already renders the
/// MDB to a file.
pub struct JsonFileMdbSource {
    path: std::path::PathBuf,
}

impl JsonFileMdbSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl MdbSource for JsonFileMdbSource {
    async fn next(&mut self) -> anyhow::Result<Mdb> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mdb: Mdb = serde_json::from_str(&contents)?;
        Ok(Mdb::sorted(mdb.machines))
    }
}

/// One AWS account/region's raw `DescribeInstances`-shaped result, modeling
/// only the output shape an AWS MDB generator produces (the AWS SDK itself
/// is out of scope for the Herd).
#[derive(Debug, Clone, Default)]
pub struct AwsTargetResult {
    pub account_id: String,
    pub account_name: String,
    pub region: String,
    pub instances: Vec<AwsInstance>,
}

#[derive(Debug, Clone, Default)]
pub struct AwsInstance {
    pub private_dns_name: String,
    pub private_ip_address: Option<String>,
    pub tags: HashMap<String, String>,
}

/// Extracts `Machine` records from one target's raw instance list,
/// recognizing the well-known tags used to populate `required_image`,
/// `planned_image`, `disable_updates`, and `owner_group`.
pub fn extract_machines(target: &AwsTargetResult) -> Vec<Machine> {
    target
        .instances
        .iter()
        .filter(|i| !i.private_dns_name.is_empty())
        .map(|instance| {
            let mut machine = Machine {
                hostname: instance.private_dns_name.clone(),
                ip_address: instance.private_ip_address.clone().unwrap_or_default(),
                aws_metadata: Some(AwsMetadata {
                    account_id: target.account_id.clone(),
                    account_name: target.account_name.clone(),
                    instance_id: String::new(),
                    region: target.region.clone(),
                    tags: instance.tags.clone(),
                }),
                ..Default::default()
            };
            for (key, value) in &instance.tags {
                match key.as_str() {
                    "RequiredImage" => machine.required_image = value.clone(),
                    "PlannedImage" => machine.planned_image = value.clone(),
                    "DisableUpdates" => machine.disable_updates = true,
                    "OwnerGroup" => machine.owner_group = value.clone(),
                    _ => {}
                }
            }
            machine
        })
        .collect()
}

/// Merges per-target extraction results into one `Mdb`, detecting
/// duplicate hostnames across targets (e.g. two AWS accounts both
/// returning an instance with the same private DNS name). The first
/// occurrence wins; the duplicate is dropped from the result and an error
/// is returned alongside the (still-usable) partial `Mdb`, matching the
/// "generator returns an error upward but partial state is still
/// published" propagation policy.
pub fn merge_aws_targets(targets: &[AwsTargetResult]) -> (Mdb, Option<anyhow::Error>) {
    let mut machines = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut first_error = None;
    for target in targets {
        for machine in extract_machines(target) {
            if !seen.insert(machine.hostname.clone()) {
                let msg = format!("duplicate hostname: {}", machine.hostname);
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!(msg));
                }
                continue;
            }
            machines.push(machine);
        }
    }
    (Mdb::sorted(machines), first_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(hostname: &str) -> Machine {
        Machine {
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn mdb_sorted_orders_by_hostname() {
        let mdb = Mdb::sorted(vec![machine("zeta"), machine("alpha"), machine("mu")]);
        let names: Vec<_> = mdb.machines.iter().map(|m| m.hostname.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mu", "zeta"]);
    }

    // Duplicate hostname across AWS accounts.
    #[test]
    fn duplicate_hostname_across_targets_is_rejected_first_wins() {
        let mut tags_a = HashMap::new();
        tags_a.insert("RequiredImage".to_string(), "img-a".to_string());
        let mut tags_b = HashMap::new();
        tags_b.insert("RequiredImage".to_string(), "img-b".to_string());

        let target_a = AwsTargetResult {
            account_id: "111".into(),
            account_name: "prod".into(),
            region: "us-east-1".into(),
            instances: vec![AwsInstance {
                private_dns_name: "h1.local".into(),
                private_ip_address: None,
                tags: tags_a,
            }],
        };
        let target_b = AwsTargetResult {
            account_id: "222".into(),
            account_name: "staging".into(),
            region: "us-west-2".into(),
            instances: vec![AwsInstance {
                private_dns_name: "h1.local".into(),
                private_ip_address: None,
                tags: tags_b,
            }],
        };

        let (mdb, err) = merge_aws_targets(&[target_a, target_b]);
        assert_eq!(mdb.machines.len(), 1);
        assert_eq!(mdb.machines[0].required_image, "img-a");
        let err = err.expect("expected a duplicate-hostname error");
        assert_eq!(err.to_string(), "duplicate hostname: h1.local");
    }

    #[test]
    fn empty_hostname_instances_are_skipped() {
        let target = AwsTargetResult {
            instances: vec![AwsInstance {
                private_dns_name: String::new(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let machines = extract_machines(&target);
        assert!(machines.is_empty());
    }
}
