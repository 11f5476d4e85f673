//! Command lines issued on the remote host.
//!
//! Commands run under `cmd.exe`; archive handling and file copy shell out to
//! PowerShell and .NET, which every supported Windows image carries.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::types::TransportError;

/// Authorises Docker against the registry using the VM service account.
pub const CONFIGURE_DOCKER: &str = "gcloud --quiet auth configure-docker";

/// Raw bytes appended per copy command. The base64 form (7600 characters)
/// keeps each `echo` line under the 8191-character `cmd.exe` limit.
pub const COPY_CHUNK_BYTES: usize = 5_700;

const POWERSHELL_PREFIX: &str = "powershell.exe -nologo -noprofile -command";
const ZIP_ASSEMBLY: &str = "Add-Type -A 'System.IO.Compression.FileSystem'";

/// Returns the final `/`-separated segment of an object key.
#[must_use]
pub fn local_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Path on the system drive where an object's archive is staged.
#[must_use]
pub fn staging_path(key: &str) -> String {
    format!(r"C:\{}", local_file_name(key))
}

/// `docker pull` for `image`.
#[must_use]
pub fn docker_pull(image: &str) -> String {
    format!("docker pull {image}")
}

/// `docker run` with the workspace mounted at the same path and used as the
/// working directory.
#[must_use]
pub fn docker_run(workspace: &str, image: &str, args: &str) -> String {
    let base = format!("docker run --rm --volume {workspace}:{workspace} --workdir {workspace} {image}");
    let extra = args.trim();
    if extra.is_empty() {
        base
    } else {
        format!("{base} {extra}")
    }
}

/// Recreates `destination` empty and extracts `archive` into it.
///
/// `ExtractToDirectory` refuses to overwrite, so a workspace left by an
/// earlier build on the same host is removed first.
#[must_use]
pub fn expand_archive(archive: &str, destination: &str) -> String {
    let target = ps_quote(destination);
    format!(
        "{POWERSHELL_PREFIX} \"& {{ $ErrorActionPreference = 'Stop'; {ZIP_ASSEMBLY}; if (Test-Path {target}) {{ Remove-Item -Recurse -Force {target} }}; New-Item -ItemType Directory -Force {target} | Out-Null; [IO.Compression.ZipFile]::ExtractToDirectory({}, {target}); }}\"",
        ps_quote(archive)
    )
}

/// Replaces `archive` with a fresh zip of `source`.
#[must_use]
pub fn compress_directory(source: &str, archive: &str) -> String {
    let quoted = ps_quote(archive);
    format!(
        "{POWERSHELL_PREFIX} \"& {{ $ErrorActionPreference = 'Stop'; {ZIP_ASSEMBLY}; if (Test-Path {quoted}) {{ Remove-Item -Force {quoted} }}; [IO.Compression.ZipFile]::CreateFromDirectory({}, {quoted}); }}\"",
        ps_quote(source)
    )
}

/// Commands that write `contents` to `remote_path` over a plain shell.
///
/// The file is staged as base64 text next to its destination, one `echo`
/// per chunk, then decoded in place by PowerShell. An empty payload still
/// produces an empty file.
#[must_use]
pub fn copy_to_commands(contents: &[u8], remote_path: &str) -> Vec<String> {
    let staging = format!("{remote_path}.b64");
    let mut commands = vec![format!(r#"if exist "{staging}" del /f /q "{staging}""#)];
    commands.extend(
        contents
            .chunks(COPY_CHUNK_BYTES)
            .map(|chunk| format!(r#"echo {} >> "{staging}""#, STANDARD.encode(chunk))),
    );
    let staged = ps_quote(&staging);
    commands.push(format!(
        "{POWERSHELL_PREFIX} \"& {{ $ErrorActionPreference = 'Stop'; $text = if (Test-Path {staged}) {{ [IO.File]::ReadAllText({staged}) -replace '\\s', '' }} else {{ '' }}; [IO.File]::WriteAllBytes({}, [Convert]::FromBase64String($text)); if (Test-Path {staged}) {{ Remove-Item -Force {staged} }} }}\"",
        ps_quote(remote_path)
    ));
    commands
}

/// Prints `remote_path` as a single base64 string.
#[must_use]
pub fn copy_from_command(remote_path: &str) -> String {
    format!(
        "{POWERSHELL_PREFIX} \"& {{ $ErrorActionPreference = 'Stop'; [Convert]::ToBase64String([IO.File]::ReadAllBytes({})) }}\"",
        ps_quote(remote_path)
    )
}

/// Decodes the output of [`copy_from_command`].
///
/// # Errors
///
/// Returns [`TransportError::Copy`] when the output is not base64.
pub fn decode_copied(remote_path: &str, stdout: &str) -> Result<Vec<u8>, TransportError> {
    let text: String = stdout.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(text).map_err(|err| TransportError::Copy {
        path: remote_path.to_owned(),
        message: format!("unreadable file contents: {err}"),
    })
}

/// Single-quotes a PowerShell string literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("folder1/folder2/filename.zip", "filename.zip")]
    #[case("test-filename.zip", "test-filename.zip")]
    #[case("prefix/", "")]
    fn local_file_name_takes_last_segment(#[case] key: &str, #[case] expected: &str) {
        assert_eq!(local_file_name(key), expected);
    }

    #[test]
    fn staging_path_uses_final_key_segment() {
        assert_eq!(staging_path("cloudbuild-windows-2024/workspace.zip"), r"C:\workspace.zip");
    }

    #[test]
    fn docker_run_mounts_workspace() {
        assert_eq!(
            docker_run(r"C:\workspace", "gcr.io/test/test", "build --all"),
            r"docker run --rm --volume C:\workspace:C:\workspace --workdir C:\workspace gcr.io/test/test build --all"
        );
        assert_eq!(
            docker_run(r"C:\ws", "img", "  "),
            r"docker run --rm --volume C:\ws:C:\ws --workdir C:\ws img"
        );
    }

    #[test]
    fn expand_archive_clears_destination_before_extracting() {
        let command = expand_archive(r"C:\workspace.zip", r"C:\it's");
        let removal = command.find("Remove-Item -Recurse").expect("removal present");
        let creation = command.find("New-Item").expect("mkdir present");
        let extraction = command.find("ExtractToDirectory").expect("extract present");

        assert!(removal < creation && creation < extraction);
        assert!(command.contains(r"ExtractToDirectory('C:\workspace.zip', 'C:\it''s')"));
        assert!(command.contains("$ErrorActionPreference = 'Stop'"));
    }

    #[test]
    fn compress_directory_removes_stale_archive_first() {
        let command = compress_directory(r"C:\workspace", r"C:\results.zip");
        let removal = command.find("Remove-Item").expect("removal present");
        let creation = command.find("CreateFromDirectory").expect("creation present");
        assert!(removal < creation);
        assert!(command.contains(r"CreateFromDirectory('C:\workspace', 'C:\results.zip')"));
    }

    #[test]
    fn copy_to_stages_chunks_within_line_limit() {
        let contents = vec![0xA5_u8; COPY_CHUNK_BYTES * 2 + 10];

        let commands = copy_to_commands(&contents, r"C:\workspace.zip");

        assert_eq!(commands.len(), 5);
        assert_eq!(
            commands.first().map(String::as_str),
            Some(r#"if exist "C:\workspace.zip.b64" del /f /q "C:\workspace.zip.b64""#)
        );
        assert!(commands.iter().all(|command| command.len() < 8191));
        let mut restored = Vec::new();
        for line in commands.iter().filter_map(|c| c.strip_prefix("echo ")) {
            let (encoded, target) = line.split_once(" >> ").expect("append redirect");
            assert_eq!(target, r#""C:\workspace.zip.b64""#);
            restored.extend(STANDARD.decode(encoded).expect("chunk is base64"));
        }
        assert_eq!(restored, contents);
        let last = commands.last().expect("decode step");
        assert!(last.contains(r"WriteAllBytes('C:\workspace.zip'"));
    }

    #[test]
    fn copy_to_empty_file_skips_chunks() {
        let commands = copy_to_commands(&[], r"C:\empty.zip");

        assert_eq!(commands.len(), 2);
        assert!(!commands.iter().any(|command| command.starts_with("echo")));
    }

    #[test]
    fn copied_output_decodes_across_line_breaks() {
        let bytes = decode_copied(r"C:\results.zip", "TVpQ\r\nSw==\r\n").expect("valid base64");
        assert_eq!(bytes, b"MZPK");
    }

    #[test]
    fn garbage_copy_output_is_a_copy_error() {
        let err = decode_copied(r"C:\results.zip", "not base64!").expect_err("invalid");
        assert!(matches!(err, TransportError::Copy { path, .. } if path == r"C:\results.zip"));
    }
}
