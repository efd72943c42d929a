//! Wire types for the ingest API. Field names follow the payload contract
//! spoken by the benchmarking harness (camelCase, short keys for the bulk
//! measurement arrays).

use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// One logical ingest request: a full trial's worth of runs, measurements,
/// and profiles against a single commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub project_name: String,
    pub experiment_name: String,
    #[serde(default)]
    pub experiment_desc: Option<String>,
    /// ISO-8601 UTC start of the trial.
    pub start_time: String,
    pub env: EnvSpec,
    pub source: SourceSpec,
    pub criteria: Vec<CriterionSpec>,
    pub data: Vec<RunGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSpec {
    pub host_name: String,
    pub os_type: String,
    pub memory: i64,
    pub cpu: String,
    pub clock_speed: i64,
    pub user_name: String,
    #[serde(default)]
    pub manual_run: bool,
    #[serde(default)]
    pub denoise: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    pub branch_or_tag: String,
    pub commit_id: String,
    pub commit_msg: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

/// Maps the payload-local criterion index `i` to a named criterion `c`
/// measured in unit `u`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionSpec {
    #[serde(rename = "i")]
    pub index: i32,
    #[serde(rename = "c")]
    pub name: String,
    #[serde(rename = "u")]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunGroup {
    #[serde(rename = "runId")]
    pub run: RunSpec,
    #[serde(rename = "d", default)]
    pub points: Vec<DataPoint>,
    #[serde(rename = "p", default)]
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "in")]
    pub invocation: i32,
    #[serde(rename = "it")]
    pub iteration: i32,
    #[serde(rename = "m")]
    pub measurements: Vec<MeasurementValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementValue {
    #[serde(rename = "c")]
    pub criterion: i32,
    #[serde(rename = "v")]
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    #[serde(rename = "in")]
    pub invocation: i32,
    #[serde(rename = "nit")]
    pub num_iterations: i32,
    #[serde(rename = "d")]
    pub data: serde_json::Value,
}

/// An invocable benchmark configuration, keyed by its full command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub cmdline: String,
    pub benchmark: BenchmarkSpec,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cores: Option<String>,
    #[serde(default)]
    pub var_value: Option<String>,
    #[serde(default)]
    pub input_size: Option<String>,
    #[serde(default)]
    pub extra_args: Option<String>,
    #[serde(default)]
    pub max_invocation_time: Option<i32>,
    #[serde(default)]
    pub min_iteration_time: Option<i32>,
    #[serde(default)]
    pub warmup: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSpec {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    pub suite: SuiteSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSpec {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    pub executor: ExecutorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSpec {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
}

/// Marks every open trial of the experiment as finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub project_name: String,
    pub experiment_name: String,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

pub(crate) async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trips_through_the_wire_shape() {
        let raw = serde_json::json!({
            "projectName": "SOM",
            "experimentName": "nightly",
            "startTime": "2026-07-30T22:00:00Z",
            "env": {
                "hostName": "bench-1",
                "osType": "Linux",
                "memory": 16_000_000_000i64,
                "cpu": "Ryzen 9 7950X",
                "clockSpeed": 4_500_000_000i64,
                "userName": "ci",
                "manualRun": false,
                "denoise": "shielding=on"
            },
            "source": {
                "repoURL": "https://example.org/som.git",
                "branchOrTag": "main",
                "commitId": "deadbeef",
                "commitMsg": "Tune GC",
                "authorName": "A",
                "authorEmail": "a@example.org",
                "committerName": "A",
                "committerEmail": "a@example.org"
            },
            "criteria": [{"i": 0, "c": "total", "u": "ms"}],
            "data": [{
                "runId": {
                    "cmdline": "som -cp . Bench 10",
                    "benchmark": {
                        "name": "Bench",
                        "suite": {
                            "name": "micro",
                            "executor": {"name": "som-ast"}
                        }
                    },
                    "cores": "1",
                    "varValue": null
                },
                "d": [
                    {"in": 1, "it": 1, "m": [{"c": 0, "v": 432.2}]},
                    {"in": 1, "it": 2, "m": [{"c": 0, "v": 430.1}]}
                ],
                "p": [{"in": 1, "nit": 2, "d": {"stack": []}}]
            }]
        });

        let report: BenchmarkReport = serde_json::from_value(raw).unwrap();
        assert_eq!(report.criteria[0].name, "total");
        assert_eq!(report.data[0].run.benchmark.suite.executor.name, "som-ast");
        assert_eq!(report.data[0].points[1].iteration, 2);
        assert_eq!(report.data[0].profiles[0].num_iterations, 2);

        let echoed = serde_json::to_value(&report).unwrap();
        assert_eq!(echoed["source"]["repoURL"], "https://example.org/som.git");
        assert_eq!(echoed["data"][0]["d"][0]["in"], 1);
    }

    #[test]
    fn completion_end_time_is_optional_on_the_wire() {
        let completion: CompletionReport = serde_json::from_value(serde_json::json!({
            "projectName": "SOM",
            "experimentName": "nightly"
        }))
        .unwrap();
        assert!(completion.end_time.is_none());
    }
}
