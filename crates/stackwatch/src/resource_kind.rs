// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource kinds recognised in drift snapshots.
//!
//! A flat lookup from CloudFormation resource type strings to a small set of
//! kinds used to group drift summaries. Unlisted types map to [`ResourceKind::Other`].

use serde::{Deserialize, Serialize};

/// Coarse resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// `AWS::EC2::Instance`
    Ec2Instance,
    /// `AWS::S3::Bucket`
    S3Bucket,
    /// `AWS::Lambda::Function`
    LambdaFunction,
    /// `AWS::RDS::DBInstance` and `AWS::RDS::DBCluster`
    RdsDatabase,
    /// Any other type.
    Other,
}

const KINDS: &[(&str, ResourceKind)] = &[
    ("AWS::EC2::Instance", ResourceKind::Ec2Instance),
    ("AWS::S3::Bucket", ResourceKind::S3Bucket),
    ("AWS::Lambda::Function", ResourceKind::LambdaFunction),
    ("AWS::RDS::DBInstance", ResourceKind::RdsDatabase),
    ("AWS::RDS::DBCluster", ResourceKind::RdsDatabase),
];

impl ResourceKind {
    /// Look up the kind for a resource type string.
    pub fn from_resource_type(resource_type: &str) -> Self {
        KINDS
            .iter()
            .find(|(name, _)| *name == resource_type)
            .map(|(_, kind)| *kind)
            .unwrap_or(ResourceKind::Other)
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Ec2Instance => "EC2 instance",
            ResourceKind::S3Bucket => "S3 bucket",
            ResourceKind::LambdaFunction => "Lambda function",
            ResourceKind::RdsDatabase => "RDS database",
            ResourceKind::Other => "Other",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(
            ResourceKind::from_resource_type("AWS::S3::Bucket"),
            ResourceKind::S3Bucket
        );
        assert_eq!(
            ResourceKind::from_resource_type("AWS::RDS::DBCluster"),
            ResourceKind::RdsDatabase
        );
        assert_eq!(
            ResourceKind::from_resource_type("AWS::SQS::Queue"),
            ResourceKind::Other
        );
        assert_eq!(ResourceKind::from_resource_type("aws::s3::bucket"), ResourceKind::Other);
    }
}
