use std::fs;
use std::path::{Path, PathBuf};

use filetime::{FileTime, set_file_mtime};
use rusqlite::Connection;
use tempfile::TempDir;

use super::*;
use crate::cli::IngestArgs;
use crate::config::default_db_path;
use crate::model::{FileStatus, StreamKind};

const VOID_HEADER: &str = "BoardBarcode,ModuleIndex,JointType,Pin,TotalVoidRatio,LargestVoidRatio,SpreadX,SpreadY,GVMean,DefectCode,SystemDefect,PinStatus,Lot,ModuleStatus,DeviceStatus";

struct Workspace {
    _dir: TempDir,
    data_root: PathBuf,
    lot_root: PathBuf,
    void_root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let data_root = dir.path().join("data");
        let lot_root = dir.path().join("Lot-Export");
        let void_root = dir.path().join("Void-Results");
        fs::create_dir_all(&lot_root).expect("lot root should be created");
        fs::create_dir_all(&void_root).expect("void root should be created");
        Self {
            _dir: dir,
            data_root,
            lot_root,
            void_root,
        }
    }

    fn args(&self) -> IngestArgs {
        IngestArgs {
            data_root: self.data_root.clone(),
            config: None,
            db_path: None,
            lot_roots: vec![self.lot_root.clone()],
            void_roots: vec![self.void_root.clone()],
            migrate: false,
            verify_checksum: false,
            max_failed_attempts: None,
            loop_interval_secs: None,
        }
    }

    fn db_path(&self) -> PathBuf {
        default_db_path(&self.data_root)
    }

    fn open(&self) -> Connection {
        Connection::open(self.db_path()).expect("store should open")
    }

    fn count(&self, sql: &str) -> i64 {
        count_rows(&self.open(), sql).expect("count query should succeed")
    }
}

fn lot_document(lot_id: &str, trays: &[(&str, i64)]) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Lot Id="{lot_id}" Recipe="RCP-1" AllowSizeNull="False" CountUniqueBarcodesOnly="True" Size="10" CarrierIndex="1">
  <Trays>
"#
    );
    for (tray_id, unit_count) in trays {
        xml.push_str(&format!("    <Tray Id=\"{tray_id}\" State=\"0\" Code=\"OK\">\n      <Units>\n"));
        for idx in 1..=*unit_count {
            xml.push_str(&format!(
                "        <Unit Id=\"{tray_id}-U{idx}\" State=\"0\" Code=\"PASS\" Idx=\"{idx}\" />\n"
            ));
        }
        xml.push_str("      </Units>\n    </Tray>\n");
    }
    xml.push_str("  </Trays>\n</Lot>\n");
    xml
}

fn void_row(barcode: &str, pin: &str, ratio: &str) -> String {
    format!("{barcode},1,Gate,{pin},{ratio},1.0,0.1,0.2,120,0,False,OK,LOT1,PASS,PASS")
}

fn write_void_file(root: &Path, name: &str, rows: &[String]) -> PathBuf {
    let path = root.join(name);
    let mut content = format!("{VOID_HEADER}\n");
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(&path, content).expect("void fixture should be written");
    path
}

fn bump_mtime(path: &Path, seconds: i64) {
    set_file_mtime(path, FileTime::from_unix_time(1_700_000_000 + seconds, 0))
        .expect("mtime should be set");
}

fn tracker_status(workspace: &Workspace, stream: StreamKind, path: &Path) -> Option<(FileStatus, u32)> {
    let connection = workspace.open();
    FileStateTracker::new(&connection, stream)
        .lookup(&path.to_string_lossy())
        .expect("lookup should succeed")
        .map(|entry| (entry.status, entry.failed_attempts))
}

#[test]
fn rerunning_over_unchanged_sources_is_idempotent() {
    let workspace = Workspace::new();
    fs::write(
        workspace.lot_root.join("LOT1.lotx"),
        lot_document("LOT1", &[("T1", 2)]),
    )
    .expect("lot fixture should be written");
    write_void_file(
        &workspace.void_root,
        "XRAY_SIC_1.csv",
        &[void_row("B1", "P1", "3.0"), void_row("B1", "P2", "4.0")],
    );

    run(workspace.args()).expect("first ingest should succeed");
    let lots = workspace.count("SELECT COUNT(*) FROM Lot_info");
    let voids = workspace.count("SELECT COUNT(*) FROM Void_results");
    let tracked = workspace.count("SELECT COUNT(*) FROM file_state");
    assert_eq!((lots, voids, tracked), (2, 2, 2));

    run(workspace.args()).expect("second ingest should succeed");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Lot_info"), lots);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), voids);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM file_state"), tracked);

    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    assert_eq!(manifest.status, "completed");
    assert_eq!(manifest.mode, "incremental");
    assert!(manifest.streams.iter().all(|stream| stream.files_candidates == 0));

    let manifests = fs::read_dir(workspace.data_root.join("manifests"))
        .expect("manifest directory should exist")
        .count();
    assert_eq!(manifests, 2);
}

#[test]
fn modified_file_is_reprocessed_and_only_new_rows_are_added() {
    let workspace = Workspace::new();
    let path = write_void_file(&workspace.void_root, "XRAY_SIC_1.csv", &[void_row("B1", "P1", "3.0")]);
    bump_mtime(&path, 0);

    run(workspace.args()).expect("first ingest should succeed");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 1);

    write_void_file(
        &workspace.void_root,
        "XRAY_SIC_1.csv",
        &[void_row("B1", "P1", "9.9"), void_row("B1", "P2", "5.0")],
    );
    bump_mtime(&path, 60);

    run(workspace.args()).expect("second ingest should succeed");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 2);

    let kept_ratio: String = workspace
        .open()
        .query_row(
            "SELECT TotalVoidRatio FROM Void_results WHERE Pin = 'P1'",
            [],
            |row| row.get(0),
        )
        .expect("row should exist");
    assert_eq!(kept_ratio, "3.0");
}

#[test]
fn reprocessed_rows_with_empty_key_cells_are_not_duplicated() {
    let workspace = Workspace::new();
    let path = write_void_file(&workspace.void_root, "XRAY_SIC_1.csv", &[void_row("B1", "", "3.0")]);
    bump_mtime(&path, 0);

    run(workspace.args()).expect("first ingest should succeed");
    assert_eq!(
        workspace.count("SELECT COUNT(*) FROM Void_results WHERE BoardBarcode = 'B1' AND Pin IS NULL"),
        1
    );

    write_void_file(
        &workspace.void_root,
        "XRAY_SIC_1.csv",
        &[void_row("B1", "", "3.0"), void_row("B1", "P2", "4.0")],
    );
    bump_mtime(&path, 60);

    run(workspace.args()).expect("second ingest should succeed");
    assert_eq!(
        workspace.count("SELECT COUNT(*) FROM Void_results WHERE BoardBarcode = 'B1' AND Pin IS NULL"),
        1
    );
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 2);
}

#[test]
fn lot_documents_flatten_to_one_row_per_unit() {
    let workspace = Workspace::new();
    fs::write(
        workspace.lot_root.join("LOT7.lotx"),
        lot_document("LOT7", &[("T1", 3), ("T2", 2)]),
    )
    .expect("lot fixture should be written");
    fs::write(workspace.lot_root.join("notes.txt"), "ignored").expect("fixture should be written");

    run(workspace.args()).expect("ingest should succeed");

    assert_eq!(workspace.count("SELECT COUNT(*) FROM Lot_info"), 5);
    assert_eq!(
        workspace.count("SELECT COUNT(*) FROM Lot_info WHERE LotId = 'LOT7' AND Recipe = 'RCP-1' AND source_filename = 'LOT7.lotx'"),
        5
    );
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Lot_info WHERE TrayId = 'T2'"), 2);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM file_state"), 1);
}

#[test]
fn missing_void_columns_are_stored_as_null() {
    let workspace = Workspace::new();
    fs::write(
        workspace.void_root.join("XRAY_SIC_short.csv"),
        "BoardBarcode,ModuleIndex,JointType,Pin,TotalVoidRatio\nB5,2,Source,P4,7.5\n",
    )
    .expect("fixture should be written");

    run(workspace.args()).expect("ingest should succeed");

    assert_eq!(
        workspace.count(
            "SELECT COUNT(*) FROM Void_results WHERE BoardBarcode = 'B5' AND GVMean IS NULL AND DeviceStatus IS NULL AND Lot IS NULL"
        ),
        1
    );
}

#[test]
fn duplicate_keys_across_files_keep_the_first_row() {
    let workspace = Workspace::new();
    write_void_file(&workspace.void_root, "XRAY_SIC_a.csv", &[void_row("B1", "P1", "1.0")]);
    write_void_file(
        &workspace.void_root,
        "XRAY_SIC_b.csv",
        &[void_row("B1", "P1", "2.0"), void_row("B1", "P2", "2.0")],
    );
    fs::write(
        workspace.lot_root.join("A.lotx"),
        lot_document("LOT1", &[("T1", 1)]),
    )
    .expect("lot fixture should be written");
    fs::write(
        workspace.lot_root.join("B.lotx"),
        lot_document("LOT1", &[("T1", 2)]),
    )
    .expect("lot fixture should be written");

    run(workspace.args()).expect("ingest should succeed");

    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 2);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Lot_info"), 2);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM file_state WHERE status = 'SUCCESS'"), 4);
}

#[test]
fn unavailable_root_does_not_block_the_rest() {
    let workspace = Workspace::new();
    write_void_file(&workspace.void_root, "XRAY_SIC_1.csv", &[void_row("B1", "P1", "1.0")]);

    let mut args = workspace.args();
    args.void_roots.insert(0, workspace.data_root.join("offline-share"));
    args.lot_roots = vec![workspace.data_root.join("also-offline")];

    run(args).expect("ingest should succeed with skipped roots");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 1);

    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    assert_eq!(manifest.status, "completed_with_errors");
    let skipped: usize = manifest.streams.iter().map(|stream| stream.roots_skipped).sum();
    assert_eq!(skipped, 2);
}

#[test]
fn failed_commit_leaves_files_unmarked_and_the_next_run_recovers() {
    let workspace = Workspace::new();
    fs::write(
        workspace.lot_root.join("LOT1.lotx"),
        lot_document("LOT1", &[("T1", 1)]),
    )
    .expect("lot fixture should be written");
    let void_path = write_void_file(&workspace.void_root, "XRAY_SIC_1.csv", &[void_row("B1", "P1", "1.0")]);

    {
        let connection = open_store(&workspace.db_path(), std::time::Duration::from_secs(5))
            .expect("store should open");
        ensure_schema(&connection).expect("schema should be created");
        connection
            .execute_batch(
                "
                CREATE TRIGGER reject_void_tracker BEFORE INSERT ON file_state
                WHEN NEW.stream = 'void_results'
                BEGIN
                  SELECT RAISE(ABORT, 'forced tracker failure');
                END;
                ",
            )
            .expect("trigger should be created");
    }

    run(workspace.args()).expect("a failed batch is not fatal");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 0);
    assert!(tracker_status(&workspace, StreamKind::VoidResults, &void_path).is_none());
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Lot_info"), 1);

    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    let void_result = manifest
        .streams
        .iter()
        .find(|stream| stream.stream == StreamKind::VoidResults)
        .expect("void stream result should exist");
    assert_eq!(void_result.batches_failed, 1);
    assert_eq!(void_result.files_uncommitted, 1);

    workspace
        .open()
        .execute_batch("DROP TRIGGER reject_void_tracker;")
        .expect("trigger should be dropped");

    run(workspace.args()).expect("recovery ingest should succeed");
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results"), 1);
    assert_eq!(
        tracker_status(&workspace, StreamKind::VoidResults, &void_path),
        Some((FileStatus::Success, 0))
    );
}

#[test]
fn repeated_process_errors_quarantine_until_requeued() {
    let workspace = Workspace::new();
    let bad = workspace.lot_root.join("BROKEN.lotx");
    fs::write(&bad, "<Lot Id=\"L\"><Trays>").expect("fixture should be written");
    bump_mtime(&bad, 0);

    let mut args = workspace.args();
    args.max_failed_attempts = Some(2);

    run(args.clone()).expect("first ingest should succeed");
    assert_eq!(
        tracker_status(&workspace, StreamKind::LotInfo, &bad),
        Some((FileStatus::ErrorProcess, 1))
    );

    run(args.clone()).expect("unchanged file is not retried");
    assert_eq!(
        tracker_status(&workspace, StreamKind::LotInfo, &bad),
        Some((FileStatus::ErrorProcess, 1))
    );

    bump_mtime(&bad, 10);
    run(args.clone()).expect("second attempt should run");
    assert_eq!(
        tracker_status(&workspace, StreamKind::LotInfo, &bad),
        Some((FileStatus::Quarantined, 2))
    );

    bump_mtime(&bad, 20);
    run(args.clone()).expect("quarantined file is skipped");
    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    let lot_result = manifest
        .streams
        .iter()
        .find(|stream| stream.stream == StreamKind::LotInfo)
        .expect("lot stream result should exist");
    assert_eq!(lot_result.files_held, 1);
    assert_eq!(lot_result.files_candidates, 0);

    let released = FileStateTracker::new(&workspace.open(), StreamKind::LotInfo)
        .release(FileStatus::Quarantined)
        .expect("release should succeed");
    assert_eq!(released, 1);

    run(args).expect("requeued file should be retried");
    assert_eq!(
        tracker_status(&workspace, StreamKind::LotInfo, &bad),
        Some((FileStatus::ErrorProcess, 1))
    );
}

#[test]
fn empty_documents_are_recorded_and_not_retried() {
    let workspace = Workspace::new();
    let empty = workspace.lot_root.join("EMPTY.lotx");
    fs::write(&empty, "<Lot Id=\"L\"><Trays /></Lot>").expect("fixture should be written");
    let header_only = write_void_file(&workspace.void_root, "XRAY_SIC_empty.csv", &[]);

    run(workspace.args()).expect("ingest should succeed");
    assert_eq!(
        tracker_status(&workspace, StreamKind::LotInfo, &empty),
        Some((FileStatus::ErrorEmpty, 0))
    );
    assert_eq!(
        tracker_status(&workspace, StreamKind::VoidResults, &header_only),
        Some((FileStatus::ErrorEmpty, 0))
    );

    run(workspace.args()).expect("rerun should succeed");
    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    assert!(manifest.streams.iter().all(|stream| stream.files_candidates == 0));
}

#[test]
fn checksum_mode_records_content_digest() {
    let workspace = Workspace::new();
    let path = write_void_file(&workspace.void_root, "XRAY_SIC_1.csv", &[void_row("B1", "P1", "1.0")]);

    let mut args = workspace.args();
    args.verify_checksum = true;
    run(args).expect("ingest should succeed");

    let expected = crate::util::sha256_file(&path).expect("hash should be computed");
    let stored: Option<String> = workspace
        .open()
        .query_row(
            "SELECT checksum FROM file_state WHERE stream = 'void_results'",
            [],
            |row| row.get(0),
        )
        .expect("tracker row should exist");
    assert_eq!(stored, Some(expected));
}

#[test]
fn migration_reads_legacy_roots_from_config() {
    let workspace = Workspace::new();
    let legacy_void = workspace.data_root.join("archive").join("Void_results");
    fs::create_dir_all(&legacy_void).expect("legacy root should be created");
    write_void_file(&legacy_void, "XRAY_SIC_old.csv", &[void_row("OLD", "P1", "1.0")]);
    write_void_file(&workspace.void_root, "XRAY_SIC_new.csv", &[void_row("NEW", "P1", "1.0")]);

    let config_path = workspace.data_root.join("ingest_config.json");
    fs::write(
        &config_path,
        serde_json::json!({
            "void_results": {
                "roots": [workspace.void_root],
                "legacy_root": legacy_void,
            }
        })
        .to_string(),
    )
    .expect("config should be written");

    let mut args = workspace.args();
    args.lot_roots.clear();
    args.void_roots.clear();
    args.migrate = true;
    args.loop_interval_secs = Some(60);
    run(args).expect("migration should run a single cycle");

    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results WHERE BoardBarcode = 'OLD'"), 1);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM Void_results WHERE BoardBarcode = 'NEW'"), 0);

    let (_, manifest) = latest_manifest(&workspace.data_root)
        .expect("manifest should load")
        .expect("manifest should exist");
    assert_eq!(manifest.mode, "migrate");
    assert_eq!(
        manifest.paths.config_path.as_deref(),
        Some(config_path.display().to_string().as_str())
    );
}

#[test]
fn concurrent_streams_share_one_store() {
    let workspace = Workspace::new();
    for index in 0..5 {
        fs::write(
            workspace.lot_root.join(format!("LOT{index}.lotx")),
            lot_document(&format!("LOT{index}"), &[("T1", 2)]),
        )
        .expect("lot fixture should be written");
        write_void_file(
            &workspace.void_root,
            &format!("XRAY_SIC_{index}.csv"),
            &[void_row(&format!("B{index}"), "P1", "1.0")],
        );
    }

    {
        let connection = open_store(&workspace.db_path(), std::time::Duration::from_secs(5))
            .expect("store should open");
        ensure_schema(&connection).expect("schema should be created");
    }

    let mut config = crate::config::PipelineConfig::default();
    config.lot_info.roots = vec![workspace.lot_root.clone()];
    config.lot_info.batch_size = Some(1);
    config.void_results.roots = vec![workspace.void_root.clone()];
    config.void_results.batch_size = Some(2);
    let settings: Vec<_> = StreamKind::ALL
        .iter()
        .map(|kind| config.stream_settings(*kind, false).expect("settings should resolve"))
        .collect();

    let results = run_streams(&workspace.db_path(), config.busy_timeout(), &settings);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].stream, StreamKind::LotInfo);
    assert_eq!(results[0].rows_inserted, 10);
    assert_eq!(results[1].stream, StreamKind::VoidResults);
    assert_eq!(results[1].rows_inserted, 5);
    assert!(results.iter().all(|result| result.fatal_error.is_none()));
    assert_eq!(workspace.count("SELECT COUNT(*) FROM file_state"), 10);
}

#[test]
fn unusable_store_path_is_fatal() {
    let workspace = Workspace::new();
    let blocker = workspace.lot_root.join("not-a-directory");
    fs::write(&blocker, "file").expect("fixture should be written");
    let mut args = workspace.args();
    args.db_path = Some(blocker.join("xray_data.sqlite"));

    assert!(run(args).is_err());
}
