use std::path::PathBuf;

use async_trait::async_trait;
use camino::Utf8Path;
use tracing::{info, warn};

use crate::domain::{Conversion, File, Job};
use crate::error::KiraError;
use crate::fs_util;
use crate::process::{ProcessRunner, SystemProcessRunner};

pub const DEFAULT_TOOL_PATH: &str = "/app/fastq/bin/fastq2bam";
pub const DEFAULT_SCHEMA: &str = "10xV2";

/// Input FASTQs in the order the converter expects: reads sorted by read
/// index, then indexes sorted by read index.
pub fn ordered_inputs(inputs: &[File]) -> Vec<&File> {
    let mut reads = Vec::new();
    let mut indexes = Vec::new();
    for input in inputs {
        match input.read_index.as_deref() {
            Some(read_index) if read_index.starts_with("read") => reads.push(input),
            Some(read_index) if read_index.starts_with("index") => indexes.push(input),
            other => warn!(
                file = %input.name,
                read_index = ?other,
                "conversion input is neither a read nor an index, ignoring"
            ),
        }
    }
    reads.sort_by(|a, b| a.read_index.cmp(&b.read_index));
    indexes.sort_by(|a, b| a.read_index.cmp(&b.read_index));
    reads.extend(indexes);
    reads
}

pub fn conversion_args(conversion: &Conversion, schema: &str) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        schema.to_string(),
        "-b".to_string(),
        conversion.output_name.to_string(),
    ];
    for (position, input) in ordered_inputs(&conversion.inputs).into_iter().enumerate() {
        args.push(format!("-{}", position + 1));
        args.push(input.name.to_string());
    }
    args
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, job: &Job, work_dir: &Utf8Path) -> Result<i32, KiraError>;
}

pub struct Fastq2BamConverter<R: ProcessRunner = SystemProcessRunner> {
    tool_path: PathBuf,
    schema: String,
    runner: R,
}

impl Fastq2BamConverter<SystemProcessRunner> {
    pub fn new(tool_path: impl Into<PathBuf>, schema: impl Into<String>) -> Self {
        Self::with_runner(tool_path, schema, SystemProcessRunner)
    }
}

impl<R: ProcessRunner> Fastq2BamConverter<R> {
    pub fn with_runner(tool_path: impl Into<PathBuf>, schema: impl Into<String>, runner: R) -> Self {
        Self {
            tool_path: tool_path.into(),
            schema: schema.into(),
            runner,
        }
    }
}

#[async_trait]
impl<R: ProcessRunner> Converter for Fastq2BamConverter<R> {
    async fn convert(&self, job: &Job, work_dir: &Utf8Path) -> Result<i32, KiraError> {
        let Some(conversion) = &job.conversion else {
            return Ok(0);
        };
        let output_path = work_dir.join(conversion.output_name.as_str());
        if fs_util::file_exists(&output_path).await {
            info!(
                manifest_id = %job.manifest_id,
                output = %conversion.output_name,
                "conversion output already exists"
            );
            return Ok(0);
        }

        let args = conversion_args(conversion, &self.schema);
        info!(
            manifest_id = %job.manifest_id,
            tool = %self.tool_path.display(),
            args = %args.join(" "),
            "running fastq2bam"
        );
        let output = self
            .runner
            .run(&self.tool_path, &args, Some(work_dir.as_std_path()))
            .await
            .map_err(|err| KiraError::Conversion {
                exit_code: None,
                stderr: format!("failed to start {}: {err}", self.tool_path.display()),
            })?;
        if !output.success() {
            return Err(KiraError::Conversion {
                exit_code: output.exit_code,
                stderr: output.failure_message(&self.tool_path),
            });
        }
        info!(manifest_id = %job.manifest_id, output = %conversion.output_name, "conversion finished");
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use parking_lot::Mutex;

    use super::*;
    use crate::process::ProcessOutput;

    struct ScriptedRunner {
        calls: Mutex<Vec<(Vec<String>, Option<PathBuf>)>>,
        exit_code: i32,
    }

    impl ScriptedRunner {
        fn exiting(exit_code: i32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &Path,
            args: &[String],
            cwd: Option<&Path>,
        ) -> std::io::Result<ProcessOutput> {
            self.calls
                .lock()
                .push((args.to_vec(), cwd.map(Path::to_path_buf)));
            Ok(ProcessOutput {
                exit_code: Some(self.exit_code),
                stdout: String::new(),
                stderr: "bad barcode".to_string(),
            })
        }
    }

    fn conversion_job() -> Job {
        serde_json::from_value(serde_json::json!({
            "manifest_id": "m-1",
            "submission_url": "https://usi/api/submissions/s-1",
            "dsp_api_url": "https://usi",
            "conversion": {
                "output_name": "out.bam",
                "inputs": [
                    { "name": "R1.fastq.gz", "read_index": "read1" },
                    { "name": "R2.fastq.gz", "read_index": "read2" }
                ]
            }
        }))
        .unwrap()
    }

    fn input(read_index: &str, name: &str) -> File {
        File {
            name: name.parse().unwrap(),
            read_index: Some(read_index.to_string()),
            cloud_url: None,
        }
    }

    #[test]
    fn orders_reads_before_indexes() {
        let conversion = Conversion {
            output_name: "mock.output.bam".parse().unwrap(),
            inputs: vec![
                input("read2", "mockR2.fastq.gz"),
                input("read1", "mockR1.fastq.gz"),
                input("index1", "mockI.fastq.gz"),
            ],
        };

        let ordered: Vec<&str> = ordered_inputs(&conversion.inputs)
            .into_iter()
            .map(|file| file.name.as_str())
            .collect();
        assert_eq!(
            ordered,
            vec!["mockR1.fastq.gz", "mockR2.fastq.gz", "mockI.fastq.gz"]
        );

        let args = conversion_args(&conversion, DEFAULT_SCHEMA);
        assert_eq!(
            args,
            vec![
                "-s",
                "10xV2",
                "-b",
                "mock.output.bam",
                "-1",
                "mockR1.fastq.gz",
                "-2",
                "mockR2.fastq.gz",
                "-3",
                "mockI.fastq.gz"
            ]
        );
    }

    #[test]
    fn index_partition_sorted_and_unknown_dropped() {
        let inputs = vec![
            input("index2", "I2.fastq.gz"),
            input("barcode", "B.fastq.gz"),
            input("index1", "I1.fastq.gz"),
            input("read1", "R1.fastq.gz"),
        ];
        let ordered: Vec<&str> = ordered_inputs(&inputs)
            .into_iter()
            .map(|file| file.name.as_str())
            .collect();
        assert_eq!(ordered, vec!["R1.fastq.gz", "I1.fastq.gz", "I2.fastq.gz"]);
    }

    #[tokio::test]
    async fn runs_tool_in_work_dir() {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let converter = Fastq2BamConverter::with_runner(
            DEFAULT_TOOL_PATH,
            DEFAULT_SCHEMA,
            ScriptedRunner::exiting(0),
        );

        let code = converter.convert(&conversion_job(), &work_dir).await.unwrap();
        assert_eq!(code, 0);
        let calls = converter.runner.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0[..4], ["-s", "10xV2", "-b", "out.bam"]);
        assert_eq!(calls[0].1.as_deref(), Some(temp.path()));
    }

    #[tokio::test]
    async fn existing_output_skips_tool() {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(work_dir.join("out.bam"), b"BAM").unwrap();
        let converter = Fastq2BamConverter::with_runner(
            DEFAULT_TOOL_PATH,
            DEFAULT_SCHEMA,
            ScriptedRunner::exiting(0),
        );

        assert_eq!(converter.convert(&conversion_job(), &work_dir).await.unwrap(), 0);
        assert!(converter.runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_conversion_failure() {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let converter = Fastq2BamConverter::with_runner(
            DEFAULT_TOOL_PATH,
            DEFAULT_SCHEMA,
            ScriptedRunner::exiting(3),
        );

        let err = converter
            .convert(&conversion_job(), &work_dir)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            KiraError::Conversion { exit_code: Some(3), stderr } if stderr == "bad barcode"
        );
    }
}
