use assert_matches::assert_matches;

use kira_archive_uploader::domain::{Job, Plan, submission_id_from_url};
use kira_archive_uploader::error::KiraError;

const PLAN: &str = r#"{
  "jobs": [
    {
      "manifest_id": "manifest-1",
      "submission_url": "https://usi.example/api/submissions/8f2e6b1c-55aa-4f0e-9d5a-0a1b2c3d4e5f",
      "dsp_api_url": "https://usi.example",
      "ingest_api_url": "https://ingest.example",
      "files": [
        { "name": "R1.fastq.gz", "read_index": "read1", "cloud_url": "s3://bucket/m1/R1.fastq.gz" },
        { "name": "R2.fastq.gz", "read_index": "read2", "cloud_url": "s3://bucket/m1/R2.fastq.gz" }
      ]
    },
    {
      "manifest_id": "manifest-2",
      "submission_url": "https://usi.example/api/submissions/sub-2",
      "dsp_api_url": "https://usi.example/",
      "files": [],
      "conversion": {
        "output_name": "sample.bam",
        "inputs": [
          { "name": "S_R1.fastq.gz", "read_index": "read1", "cloud_url": "s3://bucket/m2/S_R1.fastq.gz" },
          { "name": "S_I1.fastq.gz", "read_index": "index1", "cloud_url": "s3://bucket/m2/S_I1.fastq.gz" }
        ]
      },
      "dcp_bundle_uuid": "bundle-uuid"
    }
  ]
}"#;

fn plan() -> Plan {
    serde_json::from_str(PLAN).unwrap()
}

#[test]
fn publish_set_without_conversion_is_every_file() {
    let job = &plan().jobs[0];
    let names: Vec<String> = job
        .files_to_publish()
        .iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(names, vec!["R1.fastq.gz", "R2.fastq.gz"]);
    assert_eq!(job.files_to_acquire().len(), 2);
    assert_eq!(job.ingest_api_url.as_deref(), Some("https://ingest.example"));
}

#[test]
fn publish_set_with_conversion_is_only_output() {
    let job = &plan().jobs[1];
    let names: Vec<String> = job
        .files_to_publish()
        .iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(names, vec!["sample.bam"]);
    let acquire: Vec<&str> = job
        .files_to_acquire()
        .iter()
        .map(|file| file.name.as_str())
        .collect();
    assert_eq!(acquire, vec!["S_R1.fastq.gz", "S_I1.fastq.gz"]);
    assert_eq!(job.bundle_id.as_deref(), Some("bundle-uuid"));
}

#[test]
fn upload_endpoint_and_submission_id() {
    let plan = plan();
    assert_eq!(plan.jobs[0].upload_endpoint(), "https://usi.example/files/");
    assert_eq!(plan.jobs[1].upload_endpoint(), "https://usi.example/files/");
    assert_eq!(
        plan.jobs[0].submission_id().unwrap(),
        "8f2e6b1c-55aa-4f0e-9d5a-0a1b2c3d4e5f"
    );
    assert_eq!(
        submission_id_from_url("https://host/api/submissions/abc").unwrap(),
        "abc"
    );
}

#[test]
fn camel_case_payload_is_accepted() {
    let job = Job::from_json(
        br#"{
            "manifestId": "m-3",
            "submissionUrl": "https://usi/api/submissions/s-3",
            "archiveApiUrl": "https://usi",
            "bundleId": "b-3",
            "files": [{ "name": "a.fastq.gz", "readIndex": "read1" }]
        }"#,
    )
    .unwrap();
    assert_eq!(job.manifest_id.as_str(), "m-3");
    assert_eq!(job.bundle_id.as_deref(), Some("b-3"));
    assert_eq!(job.files[0].read_index.as_deref(), Some("read1"));
    assert!(job.files[0].source().is_none());
}

#[test]
fn malformed_payload_is_a_parse_failure() {
    assert_matches!(Job::from_json(b"not json"), Err(KiraError::JobParse(_)));
    assert_matches!(
        Job::from_json(br#"{"manifest_id": "m-1"}"#),
        Err(KiraError::JobParse(_))
    );
    assert_matches!(
        Job::from_json(
            br#"{"manifest_id": "a/../b", "submission_url": "https://u/s/1", "dsp_api_url": "https://u"}"#
        ),
        Err(KiraError::JobParse(_))
    );
}
