//! `zfs send` / `zfs recv` command lines for a replication task

use crate::command;
use crate::replication::task::{ReplicationTask, TransferMode};

/// Arguments of the `zfs send` invocation
///
/// Always parsable-verbose (`-P -v`) so progress can be read from stderr.
pub fn send_args(task: &ReplicationTask) -> Vec<String> {
    let mut args = vec![
        task.zfs_binary.clone(),
        "send".to_string(),
        "-P".to_string(),
        "-v".to_string(),
    ];

    let base = match task.mode() {
        // Stream flags are encoded in the token
        TransferMode::Resume(token) => {
            args.push("-t".to_string());
            args.push(token.to_string());
            return args;
        }
        TransferMode::Incremental(base) => Some(base),
        TransferMode::Full => None,
    };

    let flags = [
        (task.properties, "-p"),
        (task.dedup, "-D"),
        (task.large_block, "-L"),
        (task.embed, "-e"),
        (task.compressed, "-c"),
    ];
    args.extend(
        flags
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, flag)| (*flag).to_string()),
    );

    if let Some(base) = base {
        args.push("-i".to_string());
        if base.contains('@') || base.contains('#') {
            args.push(base.to_string());
        } else {
            args.push(format!("{}@{}", task.source_dataset, base));
        }
    }

    args.push(format!("{}@{}", task.source_dataset, task.snapshot));
    args
}

/// Arguments of the `zfs recv` invocation
///
/// `-s` keeps a resume token when the stream is cut off.
pub fn receive_args(task: &ReplicationTask) -> Vec<String> {
    vec![
        task.zfs_binary.clone(),
        "recv".to_string(),
        "-s".to_string(),
        "-F".to_string(),
        task.target_dataset.clone(),
    ]
}

/// Command run on the sending shell
pub fn sender_command(task: &ReplicationTask) -> Vec<String> {
    let send = send_args(task);
    match task.compression {
        None => send,
        Some(compression) => pipeline(&send, compression.compress_args(), ZfsStage::Upstream),
    }
}

/// Command run on the receiving shell
pub fn receiver_command(task: &ReplicationTask) -> Vec<String> {
    let recv = receive_args(task);
    match task.compression {
        None => recv,
        Some(compression) => pipeline(compression.decompress_args(), &recv, ZfsStage::Downstream),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZfsStage {
    Upstream,
    Downstream,
}

/// `upstream | downstream` as an `sh -c` script
///
/// Exits with the status of the zfs stage, or with the other stage's status
/// when zfs succeeded. The upstream status leaves the pipeline through fd 3.
fn pipeline<U, D>(upstream: &[U], downstream: &[D], zfs: ZfsStage) -> Vec<String>
where
    U: AsRef<str>,
    D: AsRef<str>,
{
    let (first, second) = match zfs {
        ZfsStage::Upstream => ("up", "down"),
        ZfsStage::Downstream => ("down", "up"),
    };
    let script = format!(
        "exec 4>&1; \
         up=$({{ {{ {upstream} 3>&- 4>&-; echo $? >&3; }} | {downstream} >&4 3>&-; }} 3>&1); \
         down=$?; up=${{up:-1}}; \
         if [ \"${first}\" -ne 0 ]; then exit \"${first}\"; fi; exit \"${second}\"",
        upstream = command::join(upstream),
        downstream = command::join(downstream),
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::task::{ReplicationCompression, ReplicationDirection};

    fn task() -> ReplicationTask {
        ReplicationTask::new(
            "tank-home",
            ReplicationDirection::Push,
            "tank/home",
            "backup/home",
            "auto-2026-10-19",
        )
    }

    #[test]
    fn test_full_send() {
        assert_eq!(
            send_args(&task()),
            vec!["zfs", "send", "-P", "-v", "tank/home@auto-2026-10-19"]
        );
    }

    #[test]
    fn test_incremental_send_with_flags() {
        let task = task()
            .with_incremental_base("auto-2026-10-18")
            .with_properties(true)
            .with_stream_flags(true, true, true, true);

        assert_eq!(
            send_args(&task),
            vec![
                "zfs",
                "send",
                "-P",
                "-v",
                "-p",
                "-D",
                "-L",
                "-e",
                "-c",
                "-i",
                "tank/home@auto-2026-10-18",
                "tank/home@auto-2026-10-19",
            ]
        );
    }

    #[test]
    fn test_incremental_from_bookmark_is_passed_through() {
        let task = task().with_incremental_base("tank/home#sent");
        let args = send_args(&task);
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "tank/home#sent");
    }

    #[test]
    fn test_resume_send_ignores_base_and_flags() {
        let task = task()
            .with_incremental_base("auto-2026-10-18")
            .with_stream_flags(true, false, false, true)
            .with_resume_token("1-e604ea4bf-e0");

        assert_eq!(
            send_args(&task),
            vec!["zfs", "send", "-P", "-v", "-t", "1-e604ea4bf-e0"]
        );
    }

    #[test]
    fn test_receive_is_resumable() {
        assert_eq!(
            receive_args(&task()),
            vec!["zfs", "recv", "-s", "-F", "backup/home"]
        );
    }

    fn run(args: &[String], input: &str) -> (i32, String) {
        use std::io::Write;
        use std::process::{Command, Stdio};

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        child
            .stdin
            .take()
            .unwrap()
            .write_all(input.as_bytes())
            .unwrap();
        let output = child.wait_with_output().unwrap();
        (
            output.status.code().unwrap(),
            String::from_utf8(output.stdout).unwrap(),
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_compression_wraps_both_sides() {
        let task = task().with_compression(ReplicationCompression::Pigz);

        let sender = sender_command(&task);
        assert_eq!(sender[..2], ["sh", "-c"]);
        assert!(sender[2].contains("{ zfs send -P -v tank/home@auto-2026-10-19 3>&- 4>&-;"));
        assert!(sender[2].contains("| pigz >&4 3>&-;"));
        assert!(sender[2].ends_with("if [ \"$up\" -ne 0 ]; then exit \"$up\"; fi; exit \"$down\""));

        let receiver = receiver_command(&task);
        assert!(receiver[2].contains("{ pigz -d 3>&- 4>&-;"));
        assert!(receiver[2].contains("| zfs recv -s -F backup/home >&4 3>&-;"));
        assert!(receiver[2].ends_with("exit \"$up\""));
    }

    #[test]
    fn test_pipeline_passes_data_through() {
        let script = pipeline(&sh("cat"), &["tr", "a-z", "A-Z"], ZfsStage::Upstream);
        assert_eq!(run(&script, "stream"), (0, "STREAM".to_string()));
    }

    #[test]
    fn test_pipeline_reports_failed_zfs_send() {
        // zfs exits 2, the compressor still succeeds
        let script = pipeline(&sh("cat >/dev/null; exit 2"), &["cat"], ZfsStage::Upstream);
        assert_eq!(run(&script, "stream").0, 2);

        let script = pipeline(&sh("cat >/dev/null"), &sh("cat; exit 5"), ZfsStage::Upstream);
        assert_eq!(run(&script, "stream").0, 5);
    }

    #[test]
    fn test_pipeline_reports_failed_zfs_recv() {
        let script = pipeline(&["cat"], &sh("cat >/dev/null; exit 3"), ZfsStage::Downstream);
        assert_eq!(run(&script, "stream").0, 3);

        let script = pipeline(&sh("cat >/dev/null; exit 4"), &sh("cat"), ZfsStage::Downstream);
        assert_eq!(run(&script, "stream").0, 4);
    }

    #[test]
    fn test_custom_binary() {
        let task = task().with_zfs_binary("/usr/local/sbin/zfs");
        assert_eq!(send_args(&task)[0], "/usr/local/sbin/zfs");
        assert_eq!(receive_args(&task)[0], "/usr/local/sbin/zfs");
    }
}
