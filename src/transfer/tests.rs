//! Unit tests for workspace archiving and transfer.

use chrono::TimeZone;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::MemoryStore;

struct Workspace {
    _tmp: TempDir,
    path: Utf8PathBuf,
}

impl Workspace {
    fn dir(&self) -> Dir {
        Dir::open_ambient_dir(&self.path, ambient_authority()).expect("open workspace")
    }

    fn write(&self, relative: &str, contents: &str) {
        let dir = self.dir();
        if let Some(parent) = Utf8Path::new(relative)
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
        {
            dir.create_dir_all(parent).expect("create parent");
        }
        dir.write(relative, contents).expect("write file");
    }

    fn read(&self, relative: &str) -> String {
        self.dir().read_to_string(relative).expect("read file")
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    Workspace { _tmp: tmp, path }
}

fn entry_names(bytes: &[u8]) -> Vec<String> {
    let archive = ZipArchive::new(Cursor::new(bytes)).expect("valid zip");
    archive.file_names().map(str::to_owned).collect()
}

fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(contents.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn location() -> ArchiveLocation {
    let started = Utc
        .with_ymd_and_hms(2024, 5, 6, 7, 8, 9)
        .single()
        .expect("valid timestamp");
    ArchiveLocation::for_build("cloudbuild-windows-", "demo-project", started)
}

#[rstest]
fn location_shares_timestamped_prefix() {
    let location = location();

    assert_eq!(location.input.bucket, "cloudbuild-windows-demo-project");
    assert_eq!(
        location.input.key,
        "cloudbuild-windows-2024-05-06T07:08:09Z/workspace.zip"
    );
    assert_eq!(
        location.results.key,
        "cloudbuild-windows-2024-05-06T07:08:09Z/results.zip"
    );
}

#[rstest]
fn empty_workspace_yields_empty_archive(workspace: Workspace) {
    let (bytes, entries) = archive_dir(&workspace.dir()).expect("archive");

    assert_eq!(entries, 0);
    assert!(entry_names(&bytes).is_empty());
}

#[rstest]
fn nested_files_keep_relative_paths(workspace: Workspace) {
    workspace.write("b.txt", "bee");
    workspace.write("src/main.c", "int main;");
    workspace.write("src/lib/util.h", "#pragma once");

    let (bytes, entries) = archive_dir(&workspace.dir()).expect("archive");

    assert_eq!(entries, 3);
    let mut names = entry_names(&bytes);
    names.sort();
    assert_eq!(names, vec!["b.txt", "src/lib/util.h", "src/main.c"]);
}

#[rstest]
fn extraction_normalises_backslashes(workspace: Workspace) {
    let bytes = zip_with(&[("out\\bin\\app.exe", "MZ"), ("log.txt", "ok")]);

    let written = extract_archive(&bytes, &workspace.dir()).expect("extract");

    assert_eq!(written, 2);
    assert_eq!(workspace.read("out/bin/app.exe"), "MZ");
    assert_eq!(workspace.read("log.txt"), "ok");
}

#[rstest]
fn extraction_overwrites_existing_files(workspace: Workspace) {
    workspace.write("result.txt", "stale");
    let bytes = zip_with(&[("result.txt", "fresh")]);

    extract_archive(&bytes, &workspace.dir()).expect("extract");

    assert_eq!(workspace.read("result.txt"), "fresh");
}

#[rstest]
#[case("../escape.txt")]
#[case("nested/../../escape.txt")]
#[case("/etc/passwd")]
#[case("C:/Windows/evil.dll")]
fn escaping_entries_are_rejected(workspace: Workspace, #[case] name: &str) {
    let bytes = zip_with(&[(name, "nope")]);

    let err = extract_archive(&bytes, &workspace.dir()).expect_err("unsafe entry");

    assert!(matches!(err, TransferError::UnsafeEntry(_)));
}

#[rstest]
fn corrupt_archive_is_reported(workspace: Workspace) {
    let err = extract_archive(b"not a zip", &workspace.dir()).expect_err("corrupt");
    assert!(matches!(err, TransferError::Archive(_)));
}

#[rstest]
#[tokio::test]
async fn upload_writes_input_object(workspace: Workspace) {
    workspace.write("build.bat", "echo hi");
    let store = MemoryStore::new();
    let transfer = WorkspaceTransfer::new(store.clone(), location());

    let archive = transfer.upload(&workspace.path).await.expect("upload");

    assert_eq!(archive.entries, 1);
    assert_eq!(archive.object, location().input);
    let stored = store
        .get(&archive.object.bucket, &archive.object.key)
        .expect("object stored");
    assert_eq!(entry_names(&stored), vec!["build.bat"]);
}

#[rstest]
#[tokio::test]
async fn download_extracts_results_over_workspace(workspace: Workspace) {
    let store = MemoryStore::new();
    let results = location().results;
    store.insert(
        &results.bucket,
        &results.key,
        zip_with(&[("artifacts/app.exe", "MZ")]),
    );
    let transfer = WorkspaceTransfer::new(store, location());

    let written = transfer.download(&workspace.path).await.expect("download");

    assert_eq!(written, 1);
    assert_eq!(workspace.read("artifacts/app.exe"), "MZ");
}

#[rstest]
#[tokio::test]
async fn missing_results_object_is_storage_error(workspace: Workspace) {
    let transfer = WorkspaceTransfer::new(MemoryStore::new(), location());

    let err = transfer
        .download(&workspace.path)
        .await
        .expect_err("no results");

    assert!(matches!(
        err,
        TransferError::Storage(StorageError::NotFound { .. })
    ));
}
