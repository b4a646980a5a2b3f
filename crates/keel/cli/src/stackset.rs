//! Stack set documents
//!
//! ```yaml
//! Stacks:
//!   - Id: network
//!     Exports:
//!       vpc-id: vpc-0a1b
//!     Resources:
//!       vpc:
//!         Type: Network::Vpc
//!         Properties: { CidrBlock: 10.0.0.0/16 }
//!         ImmutableProperties: [CidrBlock]
//!         BacksExports: [vpc-id]
//!   - Id: app
//!     Imports: [vpc-id]
//! ```

use crate::error::{CliError, CliResult};
use keel_types::StackSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct StackSetDocument {
    stacks: Vec<StackSpec>,
}

/// Read and validate the stacks of a stack set file.
pub fn load(path: &Path) -> CliResult<Vec<StackSpec>> {
    let contents = std::fs::read_to_string(path).map_err(|e| CliError::StackSet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse(&contents).map_err(|reason| CliError::StackSet {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse(contents: &str) -> Result<Vec<StackSpec>, String> {
    let document: StackSetDocument = serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
    if document.stacks.is_empty() {
        return Err("declares no stacks".into());
    }
    for stack in &document.stacks {
        stack.validate().map_err(|e| e.to_string())?;
    }
    Ok(document.stacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{ExportName, HealthCheckType, ResourceId};
    use std::time::Duration;

    const TWO_TIER: &str = r#"
Stacks:
  - Id: network
    Exports:
      vpc-id: vpc-0a1b
    Resources:
      vpc:
        Type: Network::Vpc
        Properties:
          CidrBlock: 10.0.0.0/16
        ImmutableProperties: [CidrBlock]
        BacksExports: [vpc-id]
  - Id: app
    Imports: [vpc-id]
    Resources:
      web:
        Type: Compute::CapacityGroup
        CapacityGroup:
          MinSize: 2
          MaxSize: 6
          DesiredCapacity: 4
          LaunchVersion: web-v7
          HealthCheckGracePeriod: PT5M
          HealthCheckType: ELB
          LoadBalancerHealthCheck:
            Interval: 30
            Timeout: 5
            HealthyThreshold: 3
            UnhealthyThreshold: 2
          UpdatePolicy:
            MinInstancesInService: 2
            MaxBatchSize: 1
            PauseTime: PT1M30S
"#;

    #[test]
    fn test_parse_two_tier_set() {
        let stacks = parse(TWO_TIER).unwrap();
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[1].imports, vec![ExportName::new("vpc-id")]);

        let web = stacks[1].resources[&ResourceId::new("web")]
            .capacity_group
            .as_ref()
            .unwrap();
        assert_eq!(web.health_check_type, HealthCheckType::LoadBalancer);
        assert_eq!(web.health_check_grace_period, Duration::from_secs(300));
        assert_eq!(web.update_policy.pause_time, Duration::from_secs(90));
        assert_eq!(
            web.load_balancer_health_check.as_ref().unwrap().interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_invalid_stack_rejected() {
        let err = parse(
            r#"
Stacks:
  - Id: app
    Imports: [vpc-id, vpc-id]
"#,
        )
        .unwrap_err();
        assert!(err.contains("more than once"), "{}", err);
        assert!(parse("Stacks: []").is_err());
        assert!(parse("Stack: []").is_err());
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load(Path::new("/nonexistent/stacks.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stacks.yaml"));
    }
}
