//! End-to-end tests for reading references into environments

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{entries, git_repo, sorted_names, tarball, write_tree, CancellingBuilder, LineBuilder};
use proto_env::{
    Context, EnvOutcome, EnvReader, Fetcher, GitFetcher, HttpFetcher, ImageFormat, ImageWriter, MemoryContainer,
    ReadRequest, SchemaError,
};
use tempfile::tempdir;

fn reader() -> EnvReader {
    EnvReader::default().with_builder(Arc::new(LineBuilder))
}

fn ready(outcome: EnvOutcome) -> proto_env::Env {
    match outcome {
        EnvOutcome::Ready(env) => env,
        EnvOutcome::Diagnostics(annotations) => panic!("unexpected diagnostics: {:?}", annotations),
    }
}

fn read(reader: &EnvReader, request: &ReadRequest) -> proto_env::Result<EnvOutcome> {
    reader.read_source_env(&Context::background(), &MemoryContainer::default(), request)
}

// =============================================================================
// Local Sources
// =============================================================================

#[test]
fn test_import_closure_scenario() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("a.proto", "package acme;\nimport \"b.proto\";\nmessage A {}\n"),
            ("b.proto", "package acme;\nmessage B {}\n"),
        ],
    );
    let value = dir.path().display().to_string();

    let without = ready(read(&reader(), &ReadRequest::new(&value).include_imports(false)).unwrap());
    assert_eq!(sorted_names(&without.image), vec!["a.proto"]);

    let with = ready(read(&reader(), &ReadRequest::new(&value).include_imports(true)).unwrap());
    assert_eq!(sorted_names(&with.image), vec!["a.proto", "b.proto"]);
    assert!(with.image.get("b.proto").unwrap().is_import());
    assert!(!with.image.get("a.proto").unwrap().is_import());
}

#[test]
fn test_without_imports_is_subset() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("api/service.proto", "import \"api/types.proto\";\nimport \"common/money.proto\";\nmessage Req {}\n"),
            ("api/types.proto", "import \"common/money.proto\";\nmessage T {}\n"),
            ("common/money.proto", "message Money {}\n"),
            ("standalone.proto", "message S {}\n"),
        ],
    );
    let value = dir.path().display().to_string();
    for paths in [vec![], vec!["api/types.proto".to_string()], vec!["api".to_string()]] {
        let without = ready(
            read(&reader(), &ReadRequest::new(&value).paths(paths.clone()).include_imports(false)).unwrap(),
        );
        let with = ready(read(&reader(), &ReadRequest::new(&value).paths(paths.clone()).include_imports(true)).unwrap());
        let small: HashSet<String> = sorted_names(&without.image).into_iter().collect();
        let large: HashSet<String> = sorted_names(&with.image).into_iter().collect();
        assert!(small.is_subset(&large), "{:?}: {:?} not within {:?}", paths, small, large);
    }
}

#[test]
fn test_explicit_paths_and_missing() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "message A {}\n"), ("b.proto", "message B {}\n")]);
    let value = dir.path().display().to_string();

    let err = read(&reader(), &ReadRequest::new(&value).paths(["a.proto", "zzz.proto"])).unwrap_err();
    assert!(matches!(err, SchemaError::NotFound(_)), "{:?}", err);

    let env = ready(
        read(
            &reader(),
            &ReadRequest::new(&value)
                .paths(["a.proto", "zzz.proto"])
                .allow_missing_paths(true),
        )
        .unwrap(),
    );
    assert_eq!(sorted_names(&env.image), vec!["a.proto"]);
}

#[test]
fn test_diagnostics_keep_order_and_use_display_paths() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("proto/a.proto", "message A {}\n// error: first\n"),
            ("proto/b.proto", "import \"missing.proto\";\n// error: third\n"),
            ("proto-env.toml", "[build]\nroots = [\"proto\"]\n"),
        ],
    );
    let value = dir.path().display().to_string();
    let outcome = read(&reader(), &ReadRequest::new(&value)).unwrap();
    let annotations = match outcome {
        EnvOutcome::Diagnostics(annotations) => annotations,
        EnvOutcome::Ready(env) => panic!("expected diagnostics, got {:?}", env),
    };

    let messages: Vec<&str> = annotations.iter().map(|a| a.message.as_str()).collect();
    assert_eq!(messages, vec!["first", "import \"missing.proto\" was not found", "third"]);
    assert_eq!(annotations[0].path, format!("{}/proto/a.proto", value));
    assert_eq!(annotations[1].path, format!("{}/proto/b.proto", value));
    assert_eq!((annotations[1].start_line, annotations[1].end_column), (1, 24));
    assert_eq!(annotations[2].start_line, 2);
}

#[test]
fn test_config_override_and_source_info() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[("proto/acme/a.proto", "message A {}\n"), ("ignored/x.proto", "message X {}\n")],
    );
    let value = dir.path().display().to_string();
    let request = ReadRequest::new(&value)
        .config_override("[build]\nroots = [\"proto\"]")
        .include_source_info(true);
    let env = ready(read(&reader(), &request).unwrap());
    assert_eq!(sorted_names(&env.image), vec!["acme/a.proto"]);
    assert!(env.image.file[0].source_code_info.is_some());
    assert_eq!(env.config.build.roots, vec![std::path::PathBuf::from("proto")]);
    assert_eq!(env.display_path("acme/a.proto"), format!("{}/proto/acme/a.proto", value));

    let request = ReadRequest::new(format!("{}#include_source_info=false", value)).include_source_info(true);
    let stripped = ready(read(&reader(), &request).unwrap());
    assert!(stripped.image.file.iter().all(|f| f.source_code_info.is_none()));
}

#[test]
fn test_list_files() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("b.proto", ""), ("a/c.proto", ""), ("notes.txt", "")]);
    let value = dir.path().display().to_string();
    let files = reader()
        .list_files(&Context::background(), &MemoryContainer::default(), &value, None)
        .unwrap();
    assert_eq!(files, vec![format!("{}/a/c.proto", value), format!("{}/b.proto", value)]);
}

#[test]
fn test_stdin_unavailable_fails_before_dispatch() {
    let err = reader()
        .read_source_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new("-"))
        .unwrap_err();
    assert!(matches!(err, SchemaError::User(_)), "{:?}", err);
}

#[test]
fn test_cancelled_read() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "message A {}\n")]);
    let ctx = Context::background();
    ctx.cancel();
    let err = reader()
        .read_source_env(&ctx, &MemoryContainer::default(), &ReadRequest::new(dir.path().display().to_string()))
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_cancel_during_build() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[("a.proto", "message A {}\n"), ("b.proto", "message B {}\n"), ("c.proto", "message C {}\n")],
    );
    let ctx = Context::background();
    let err = EnvReader::default()
        .with_builder(Arc::new(CancellingBuilder { after: 1 }))
        .read_source_env(&ctx, &MemoryContainer::default(), &ReadRequest::new(dir.path().display().to_string()))
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_concurrent_reads_share_config() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "message A {}\n"), ("proto-env.toml", "version = \"v1beta1\"\n")]);
    let value = dir.path().display().to_string();
    let reader = Arc::new(reader());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reader = Arc::clone(&reader);
            let value = value.clone();
            std::thread::spawn(move || {
                let outcome = reader
                    .read_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new(value))
                    .unwrap();
                ready(outcome).config
            })
        })
        .collect();
    let configs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(configs.iter().all(|c| Arc::ptr_eq(c, &configs[0])));
}

// =============================================================================
// Images
// =============================================================================

#[test]
fn test_image_round_trip_through_files() {
    let dir = tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("src/a.proto", "import \"b.proto\";\nmessage A {}\n"),
            ("src/b.proto", "message B {}\n"),
        ],
    );
    let source = ready(
        read(
            &reader(),
            &ReadRequest::new(dir.path().join("src").display().to_string())
                .include_imports(true)
                .include_source_info(true),
        )
        .unwrap(),
    );

    let ctx = Context::background();
    for name in ["image.bin", "image.json", "image.bin.gz", "image.json.gz"] {
        let path = dir.path().join(name);
        ImageWriter::new()
            .write_image(&ctx, &mut Vec::new(), path.to_str().unwrap(), false, &source.image)
            .unwrap();
        let request = ReadRequest::new(path.display().to_string())
            .include_imports(true)
            .include_source_info(true);
        let env = reader()
            .read_image_env(&ctx, &MemoryContainer::default(), &request)
            .unwrap();
        assert_eq!(env.image, source.image, "{}", name);

        let targets_only = reader()
            .read_image_env(&ctx, &MemoryContainer::default(), &ReadRequest::new(path.display().to_string()))
            .unwrap();
        assert_eq!(sorted_names(&targets_only.image), vec!["a.proto"]);
    }
}

#[test]
fn test_plain_descriptor_set_keeps_everything() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "import \"b.proto\";\nmessage A {}\n"), ("b.proto", "message B {}\n")]);
    let source = ready(
        read(
            &reader(),
            &ReadRequest::new(dir.path().display().to_string())
                .include_imports(true)
                .include_source_info(true),
        )
        .unwrap(),
    );

    let mut bytes = Vec::new();
    ImageWriter::new()
        .write_image(&Context::background(), &mut bytes, "-", true, &source.image)
        .unwrap();
    let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(bytes));
    let env = reader()
        .read_image_env(
            &Context::background(),
            &container,
            &ReadRequest::new("-").include_imports(false).include_source_info(false),
        )
        .unwrap();
    assert!(!env.image.has_provenance());
    assert_eq!(sorted_names(&env.image), vec!["a.proto", "b.proto"]);
    assert!(env.image.file.iter().all(|f| f.source_code_info.is_some()));
}

#[cfg(unix)]
#[test]
fn test_null_sink() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "message A {}\n")]);
    let env = ready(read(&reader(), &ReadRequest::new(dir.path().display().to_string())).unwrap());
    let before: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
    for value in ["/dev/null", "/dev/null#format=json,compression=gzip"] {
        ImageWriter::new()
            .write_image(&Context::background(), &mut Vec::new(), value, false, &env.image)
            .unwrap();
    }
    let after: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(before, after);
}

#[test]
fn test_read_env_dispatches_images() {
    let dir = tempdir().unwrap();
    write_tree(dir.path(), &[("a.proto", "message A {}\n")]);
    let env = ready(read(&reader(), &ReadRequest::new(dir.path().display().to_string())).unwrap());
    let path = dir.path().join("out.json");
    ImageWriter::new()
        .write_image(&Context::background(), &mut Vec::new(), path.to_str().unwrap(), false, &env.image)
        .unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(proto_env::decode_image(&bytes, ImageFormat::JSON).unwrap(), env.image);

    let outcome = EnvReader::default()
        .read_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new(path.display().to_string()))
        .unwrap();
    assert_eq!(ready(outcome).image, env.image);
}

// =============================================================================
// Remote Sources
// =============================================================================

#[test]
fn test_git_source_leaves_no_temp_dirs() {
    let repo = tempdir().unwrap();
    git_repo(
        repo.path(),
        &[
            ("schemas/a.proto", "import \"b.proto\";\nmessage A {}\n"),
            ("schemas/b.proto", "message B {}\n"),
            ("schemas/proto-env.toml", "version = \"v1beta1\"\n"),
        ],
    );
    let temp = tempdir().unwrap();
    let reader = reader().with_fetcher(Fetcher::new(
        GitFetcher::new().with_temp_root(temp.path()),
        HttpFetcher::new().with_temp_root(temp.path()),
    ));
    let value = format!("file://{}#subdir=schemas", repo.path().display());

    let env = ready(
        reader
            .read_source_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new(&value).include_imports(true))
            .unwrap(),
    );
    assert_eq!(sorted_names(&env.image), vec!["a.proto", "b.proto"]);
    assert_eq!(env.display_path("a.proto"), "a.proto");
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);

    let ctx = Context::background();
    ctx.cancel();
    let err = reader
        .read_source_env(&ctx, &MemoryContainer::default(), &ReadRequest::new(&value))
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_cancel_during_build_of_git_source_leaves_no_temp_dirs() {
    let repo = tempdir().unwrap();
    git_repo(repo.path(), &[("a.proto", "message A {}\n"), ("b.proto", "message B {}\n")]);
    let temp = tempdir().unwrap();
    let reader = EnvReader::default()
        .with_builder(Arc::new(CancellingBuilder { after: 1 }))
        .with_fetcher(Fetcher::new(
            GitFetcher::new().with_temp_root(temp.path()),
            HttpFetcher::new().with_temp_root(temp.path()),
        ));
    let value = format!("file://{}", repo.path().display());
    let err = reader
        .read_source_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new(&value))
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(entries(temp.path()).is_empty());
}

#[test]
fn test_stdin_tarball_source() {
    let body = tarball(&[
        ("protos-main/a.proto", "import \"b.proto\";\nmessage A {}\n"),
        ("protos-main/b.proto", "message B {}\n"),
    ]);
    let temp = tempdir().unwrap();
    let reader = reader().with_fetcher(Fetcher::new(
        GitFetcher::new().with_temp_root(temp.path()),
        HttpFetcher::new().with_temp_root(temp.path()),
    ));

    let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(body.clone()));
    let env = ready(
        reader
            .read_source_env(
                &Context::background(),
                &container,
                &ReadRequest::new("-#format=targz,strip_components=1").include_imports(true),
            )
            .unwrap(),
    );
    assert_eq!(sorted_names(&env.image), vec!["a.proto", "b.proto"]);
    assert!(entries(temp.path()).is_empty());

    // read_env dispatches a stdin tarball to the source pipeline too
    let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(body));
    let env = ready(
        reader
            .read_env(&Context::background(), &container, &ReadRequest::new("-#format=tar,compression=gzip,strip_components=1"))
            .unwrap(),
    );
    assert_eq!(sorted_names(&env.image), vec!["a.proto"]);
    assert!(entries(temp.path()).is_empty());
}

#[test]
fn test_stdin_image_is_not_source() {
    let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(Vec::new()));
    let err = reader()
        .with_flag("--input")
        .read_source_env(&Context::background(), &container, &ReadRequest::new("-"))
        .unwrap_err();
    match err {
        SchemaError::InvalidReference(msg) => {
            assert!(msg.starts_with("--input:"));
            assert!(msg.contains("-#format=tar"));
        }
        other => panic!("expected InvalidReference, got {:?}", other),
    }
}

#[test]
fn test_stdin_tarball_is_not_image() {
    let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(Vec::new()));
    let err = reader()
        .read_image_env(&Context::background(), &container, &ReadRequest::new("-#format=targz"))
        .unwrap_err();
    assert!(matches!(err, SchemaError::InvalidReference(_)), "{:?}", err);
}

#[test]
fn test_http_archive_source() {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    let body = tarball(&[
        ("protos-main/a.proto", "import \"b.proto\";\nmessage A {}\n"),
        ("protos-main/b.proto", "message B {}\n"),
    ]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        }
    });

    let temp = tempdir().unwrap();
    let reader = reader().with_fetcher(Fetcher::new(
        GitFetcher::new().with_temp_root(temp.path()),
        HttpFetcher::new().with_temp_root(temp.path()),
    ));
    let value = format!("http://{}/protos.tar.gz#strip_components=1", addr);
    let env = ready(
        reader
            .read_source_env(&Context::background(), &MemoryContainer::default(), &ReadRequest::new(&value))
            .unwrap(),
    );
    assert_eq!(sorted_names(&env.image), vec!["a.proto"]);
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}
