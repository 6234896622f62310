use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Purpose of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildTarget {
    Dev,
    Test,
    TestDev,
    Prod,
    Dist,
}

impl BuildTarget {
    pub const ALL: [BuildTarget; 5] = [
        BuildTarget::Dev,
        BuildTarget::Test,
        BuildTarget::TestDev,
        BuildTarget::Prod,
        BuildTarget::Dist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuildTarget::Dev => "dev",
            BuildTarget::Test => "test",
            BuildTarget::TestDev => "testDev",
            BuildTarget::Prod => "prod",
            BuildTarget::Dist => "dist",
        }
    }

    /// Segment used in task names, e.g. `scripts:core:test-live`.
    pub fn task_segment(self) -> &'static str {
        match self {
            BuildTarget::TestDev => "test-live",
            other => other.as_str(),
        }
    }

    pub fn is_dev(self) -> bool {
        matches!(self, BuildTarget::Dev | BuildTarget::TestDev)
    }

    pub fn is_test(self) -> bool {
        matches!(self, BuildTarget::Test | BuildTarget::TestDev)
    }
}

impl Display for BuildTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildTarget::ALL
            .into_iter()
            .find(|target| target.as_str() == s || target.task_segment() == s)
            .ok_or_else(|| format!("unknown build target '{s}'"))
    }
}

static RE_RELEASE_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Version-v(\d+)\.(\d+)\.(\d+)").expect("static regex"));

/// Environment the built application runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
    ReleaseCandidate,
    PullRequest,
    Other,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::ReleaseCandidate => "release-candidate",
            Environment::PullRequest => "pull-request",
            Environment::Other => "other",
        }
    }

    /// Classify a build. Development and test targets win over anything the
    /// CI reports.
    pub fn detect(target: BuildTarget, ci: &CiInfo) -> Self {
        if target.is_dev() {
            return Environment::Development;
        }
        if target.is_test() {
            return Environment::Testing;
        }

        let branch = ci.branch.as_deref().unwrap_or_default();

        if RE_RELEASE_BRANCH.is_match(branch) {
            Environment::ReleaseCandidate
        } else if branch == "develop" {
            Environment::Staging
        } else if ci.pull_request {
            Environment::PullRequest
        } else if target == BuildTarget::Prod {
            Environment::Production
        } else {
            Environment::Other
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the CI provider tells us about the current build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiInfo {
    pub branch: Option<String>,
    pub pull_request: bool,
}

impl CiInfo {
    /// Read from the process environment. Understands the common
    /// `GITHUB_*` and `CIRCLE_*` variables.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let branch = var("GITHUB_HEAD_REF")
            .or_else(|| var("GITHUB_REF_NAME"))
            .or_else(|| var("CIRCLE_BRANCH"));
        let pull_request = var("GITHUB_HEAD_REF").is_some() || var("CIRCLE_PULL_REQUEST").is_some();

        Self {
            branch,
            pull_request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ci(branch: &str, pull_request: bool) -> CiInfo {
        CiInfo {
            branch: Some(branch.into()),
            pull_request,
        }
    }

    #[test]
    fn test_dev_and_test_targets() {
        let release = ci("Version-v10.0.0", true);
        assert_eq!(Environment::detect(BuildTarget::Dev, &release), Environment::Development);
        assert_eq!(Environment::detect(BuildTarget::TestDev, &release), Environment::Development);
        assert_eq!(Environment::detect(BuildTarget::Test, &release), Environment::Testing);
    }

    #[test]
    fn test_ci_classification() {
        let cases = [
            (BuildTarget::Dist, ci("Version-v10.24.1", false), Environment::ReleaseCandidate),
            (BuildTarget::Prod, ci("Version-v1.2.3-hotfix", true), Environment::ReleaseCandidate),
            (BuildTarget::Dist, ci("develop", false), Environment::Staging),
            (BuildTarget::Dist, ci("feature/x", true), Environment::PullRequest),
            (BuildTarget::Prod, ci("master", false), Environment::Production),
            (BuildTarget::Dist, ci("master", false), Environment::Other),
            (BuildTarget::Dist, ci("Version-10.0.0", false), Environment::Other),
            (BuildTarget::Dist, ci("backport/Version-v10.0.0", false), Environment::Other),
            (BuildTarget::Prod, CiInfo::default(), Environment::Production),
        ];

        for (target, info, expected) in cases {
            assert_eq!(Environment::detect(target, &info), expected, "{info:?}");
        }
    }

    #[test]
    fn test_target_names() {
        assert_eq!("testDev".parse::<BuildTarget>(), Ok(BuildTarget::TestDev));
        assert_eq!("test-live".parse::<BuildTarget>(), Ok(BuildTarget::TestDev));
        assert!("staging".parse::<BuildTarget>().is_err());
        assert_eq!(BuildTarget::Prod.task_segment(), "prod");
    }
}
