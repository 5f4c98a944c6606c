//! Tests for archive and page names with spaces, non-ASCII characters and odd
//! extensions.

use shukusho::error::Result;
use shukusho::path_utils::{
    arena_dir_name, get_file_name_lossy, has_extension, is_hidden_file, partial_output_path,
};
use shukusho::prelude::*;

mod common;
use common::{
    collect_until_idle, done_results, hidden_entries, jpeg_page, setup_test_dirs, test_config,
    write_cbz, zip_member_names,
};

#[test]
fn test_scratch_names_are_hidden_and_distinct() {
    let archive = Path::new("/library/ファイル vol:1.cbr");
    let first = arena_dir_name(archive, 1);
    let second = arena_dir_name(archive, 2);

    assert!(first.starts_with('.'));
    assert!(!first.contains(':'));
    assert_ne!(first, second);

    let partial = partial_output_path(Path::new("/library/тест.cbz"), 9);
    assert_eq!(partial.parent(), Some(Path::new("/library")));
    assert!(is_hidden_file(&partial));
    assert!(!has_extension(&partial, &["cbz"]));
}

#[test]
fn test_extension_matching_ignores_case() {
    assert!(has_extension(Path::new("Comic.CBZ"), &["cbz", "cbr"]));
    assert!(has_extension(Path::new("dir.with.dots/Comic.cBr"), &["cbz", "cbr"]));
    assert!(!has_extension(Path::new("Comic.cbz.bak"), &["cbz", "cbr"]));
    assert!(!has_extension(Path::new("cbz"), &["cbz"]));
    assert_eq!(get_file_name_lossy(Path::new("/a/b/Ünïcödé.cbz")), "Ünïcödé.cbz");
}

#[tokio::test]
async fn test_converts_archives_with_special_characters() -> Result<()> {
    let dirs = setup_test_dirs("special_chars").await;
    let folder = dirs.library.join("シリーズ [2024] & more");
    let comic = folder.join("第1巻 (digital) #1.CBZ");
    write_cbz(
        &comic,
        &[
            ("Глава 1/страница 01.jpg", jpeg_page(48, 64, 1)?),
            ("Глава 1/страница 02.JPG", jpeg_page(48, 64, 2)?),
        ],
    )?;

    let (engine, mut events) = Engine::start(test_config().build()?);
    let report = engine
        .submit(&dirs.library, 80, ConcurrencyMode::Full)
        .await?;
    assert_eq!(report.discovered, 1);

    let collected = collect_until_idle(&mut events).await;
    let results = done_results(&collected);
    assert_eq!(results[0].outcome, JobOutcome::Converted);

    // The upper-case extension is normalised on output
    let output = folder.join("第1巻 (digital) #1.cbz");
    assert_eq!(results[0].output.as_deref(), Some(output.as_path()));
    assert_eq!(
        zip_member_names(&output)?,
        vec!["страница 01.webp", "страница 02.webp"]
    );
    assert!(hidden_entries(&folder).is_empty());
    Ok(())
}
