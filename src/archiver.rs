//! 아카이버 - 페이로드 폴더 압축/해제 및 크기 추정
//!
//! - tar: 추정 크기가 실제 아카이브 크기와 정확히 일치
//! - zip: deflate, 추정은 상한값
//! - null: 단일 파일을 그대로 복사

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::{Error, Result};

/// tar 블록 크기
pub const TAR_BLOCK_SIZE: u64 = 512;

/// GNU tar 헤더의 이름 필드 길이
const TAR_NAME_FIELD: usize = 100;

/// 아카이버 경계
pub trait Archiver: Send + Sync {
    fn name(&self) -> &'static str;

    /// 아카이브 파일 확장자
    fn extension(&self) -> &'static str;

    /// `src` 를 `dest` 아카이브로 압축
    ///
    /// `include_self` 이면 엔트리 이름 앞에 `src` 폴더 이름을 붙인다.
    /// `src` 가 없으면 `Ok(false)`.
    fn compress(&self, src: &Path, dest: &Path, include_self: bool) -> Result<bool>;

    /// `archive` 를 `dest_dir` 에 해제
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<bool>;

    /// 압축하지 않고 아카이브 크기 추정
    fn estimate_compressed_size(&self, src: &Path) -> Result<u64>;

    /// 아카이브에 기록된 파일 원본 크기 합
    fn content_size(&self, archive: &Path) -> Result<u64>;

    fn is_supported(&self, file: &Path) -> bool {
        file.extension().and_then(|e| e.to_str()) == Some(self.extension())
    }

    /// 추정 크기가 실제 크기와 같은지
    fn estimate_is_exact(&self) -> bool;
}

/// 설정에서 선택하는 아카이버 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiverKind {
    #[default]
    Tar,
    Zip,
    Null,
}

impl ArchiverKind {
    pub fn build(&self) -> std::sync::Arc<dyn Archiver> {
        match self {
            ArchiverKind::Tar => std::sync::Arc::new(TarArchiver),
            ArchiverKind::Zip => std::sync::Arc::new(ZipArchiver),
            ArchiverKind::Null => std::sync::Arc::new(NullArchiver),
        }
    }
}

/// 아카이브에 들어갈 파일 목록 (이름순, 상대 경로)
fn collect_files(src: &Path, include_self: bool) -> Result<Vec<(PathBuf, String)>> {
    let prefix = if include_self {
        src.file_name().map(|n| n.to_string_lossy().into_owned())
    } else {
        None
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Archive(e.to_string()))?;
        let mut name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if let Some(prefix) = &prefix {
            name = format!("{prefix}/{name}");
        }
        files.push((entry.path().to_path_buf(), name));
    }
    Ok(files)
}

fn pad_to_block(size: u64) -> u64 {
    size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE
}

/// tar 엔트리 하나의 크기 (헤더 + 패딩된 데이터)
pub fn tar_entry_size(name_len: usize, file_size: u64) -> u64 {
    let header = if name_len <= TAR_NAME_FIELD {
        TAR_BLOCK_SIZE
    } else {
        // GNU long name: LongLink 헤더 + 이름(널 포함) + 실제 헤더
        TAR_BLOCK_SIZE + pad_to_block(name_len as u64 + 1) + TAR_BLOCK_SIZE
    };
    header + pad_to_block(file_size)
}

/// tar 아카이버
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn extension(&self) -> &'static str {
        "tar"
    }

    fn compress(&self, src: &Path, dest: &Path, include_self: bool) -> Result<bool> {
        if !src.is_dir() {
            return Ok(false);
        }
        let files = collect_files(src, include_self)?;
        let mut builder = tar::Builder::new(BufWriter::new(File::create(dest)?));
        for (path, name) in &files {
            builder.append_path_with_name(path, name)?;
        }
        let mut writer = builder.into_inner()?;
        writer.flush()?;
        Ok(true)
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<bool> {
        if !archive.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(dest_dir)?;
        tar::Archive::new(File::open(archive)?).unpack(dest_dir)?;
        Ok(true)
    }

    fn estimate_compressed_size(&self, src: &Path) -> Result<u64> {
        let mut total = 0;
        for (path, name) in collect_files(src, false)? {
            total += tar_entry_size(name.len(), fs::metadata(&path)?.len());
        }
        // 종료 블록 2개
        Ok(total + 2 * TAR_BLOCK_SIZE)
    }

    fn content_size(&self, archive: &Path) -> Result<u64> {
        let mut archive = tar::Archive::new(File::open(archive)?);
        let mut total = 0;
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() {
                total += entry.header().size()?;
            }
        }
        Ok(total)
    }

    fn estimate_is_exact(&self) -> bool {
        true
    }
}

/// zip (deflate) 아카이버
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipArchiver;

/// local header(30) + central header(46) + data descriptor / zip64 여유분
const ZIP_ENTRY_OVERHEAD: u64 = 30 + 46 + 64;

/// end of central directory (zip64 포함)
const ZIP_TRAILER: u64 = 22 + 56 + 20;

impl Archiver for ZipArchiver {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extension(&self) -> &'static str {
        "zip"
    }

    fn compress(&self, src: &Path, dest: &Path, include_self: bool) -> Result<bool> {
        if !src.is_dir() {
            return Ok(false);
        }
        let files = collect_files(src, include_self)?;
        let mut zip = zip::ZipWriter::new(BufWriter::new(File::create(dest)?));
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(true);

        for (path, name) in &files {
            zip.start_file(name.as_str(), options)?;
            io::copy(&mut File::open(path)?, &mut zip)?;
        }
        let mut writer = zip.finish()?;
        writer.flush()?;
        Ok(true)
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<bool> {
        if !archive.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(dest_dir)?;
        zip::ZipArchive::new(File::open(archive)?)?.extract(dest_dir)?;
        Ok(true)
    }

    fn estimate_compressed_size(&self, src: &Path) -> Result<u64> {
        let mut total = ZIP_TRAILER;
        for (path, name) in collect_files(src, false)? {
            let size = fs::metadata(&path)?.len();
            // 압축되지 않는 데이터는 stored 블록 헤더(5바이트/블록)만큼 커진다
            let deflate_worst = size + (size / 16_383 + 1) * 5;
            total += ZIP_ENTRY_OVERHEAD + 2 * name.len() as u64 + deflate_worst;
        }
        Ok(total)
    }

    fn content_size(&self, archive: &Path) -> Result<u64> {
        let mut archive = zip::ZipArchive::new(File::open(archive)?)?;
        let mut total = 0;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if !entry.is_dir() {
                total += entry.size();
            }
        }
        Ok(total)
    }

    fn estimate_is_exact(&self) -> bool {
        false
    }
}

/// 파일 하나를 그대로 전송하는 아카이버
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArchiver;

/// 해제 시 사용하는 파일 이름
pub const NULL_ARCHIVE_ENTRY: &str = "payload";

impl NullArchiver {
    /// 폴더 안의 유일한 파일 (파일이 아니면 그 자체)
    fn single_file(src: &Path) -> Result<Option<PathBuf>> {
        if src.is_file() {
            return Ok(Some(src.to_path_buf()));
        }
        if !src.is_dir() {
            return Ok(None);
        }
        let mut files = collect_files(src, false)?;
        match files.len() {
            0 => Ok(None),
            1 => Ok(files.pop().map(|(path, _)| path)),
            n => Err(Error::Archive(format!(
                "null archiver expects a single file, found {n} in {}",
                src.display()
            ))),
        }
    }
}

impl Archiver for NullArchiver {
    fn name(&self) -> &'static str {
        "null"
    }

    fn extension(&self) -> &'static str {
        "bin"
    }

    fn compress(&self, src: &Path, dest: &Path, _include_self: bool) -> Result<bool> {
        match Self::single_file(src)? {
            Some(file) => {
                fs::copy(file, dest)?;
                Ok(true)
            }
            None if src.is_dir() => {
                File::create(dest)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<bool> {
        if !archive.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(dest_dir)?;
        fs::copy(archive, dest_dir.join(NULL_ARCHIVE_ENTRY))?;
        Ok(true)
    }

    fn estimate_compressed_size(&self, src: &Path) -> Result<u64> {
        match Self::single_file(src)? {
            Some(file) => Ok(fs::metadata(file)?.len()),
            None => Ok(0),
        }
    }

    fn content_size(&self, archive: &Path) -> Result<u64> {
        Ok(fs::metadata(archive)?.len())
    }

    fn estimate_is_exact(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 고정 크기 파일로 이루어진 테스트 폴더
    fn corpus(root: &Path) -> PathBuf {
        let src = root.join("corpus");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), vec![b'a'; 1000]).unwrap();
        fs::write(src.join("b.bin"), vec![7u8; 512]).unwrap();
        fs::write(src.join("nested").join("c.dat"), vec![1u8; 4096 + 17]).unwrap();
        fs::write(src.join("empty"), b"").unwrap();
        let long_name = "x".repeat(140);
        fs::write(src.join(long_name), vec![2u8; 33]).unwrap();
        src
    }

    fn dir_size(path: &Path) -> u64 {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.metadata().unwrap().len())
            .sum()
    }

    #[test]
    fn test_tar_entry_size_model() {
        assert_eq!(tar_entry_size(5, 0), 512);
        assert_eq!(tar_entry_size(5, 1), 1024);
        assert_eq!(tar_entry_size(100, 512), 1024);
        // 101바이트 이름: LongLink(512) + 이름 블록(512) + 헤더(512)
        assert_eq!(tar_entry_size(101, 512), 2048);
    }

    #[test]
    fn test_tar_estimate_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let src = corpus(dir.path());
        let archive = dir.path().join("out.tar");

        let estimate = TarArchiver.estimate_compressed_size(&src).unwrap();
        assert!(TarArchiver.compress(&src, &archive, false).unwrap());
        assert_eq!(fs::metadata(&archive).unwrap().len(), estimate);
    }

    #[test]
    fn test_tar_round_trip_preserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let src = corpus(dir.path());
        let archive = dir.path().join("out.tar");
        let restored = dir.path().join("restored");

        TarArchiver.compress(&src, &archive, false).unwrap();
        assert!(TarArchiver.extract(&archive, &restored).unwrap());
        assert_eq!(dir_size(&restored), dir_size(&src));
        assert_eq!(
            TarArchiver.estimate_compressed_size(&restored).unwrap(),
            fs::metadata(&archive).unwrap().len()
        );
    }

    #[test]
    fn test_zip_estimate_is_upper_bound() {
        let dir = tempfile::tempdir().unwrap();
        let src = corpus(dir.path());
        let archive = dir.path().join("out.zip");
        let restored = dir.path().join("restored");

        let estimate = ZipArchiver.estimate_compressed_size(&src).unwrap();
        assert!(ZipArchiver.compress(&src, &archive, false).unwrap());
        assert!(fs::metadata(&archive).unwrap().len() <= estimate);

        ZipArchiver.extract(&archive, &restored).unwrap();
        assert_eq!(dir_size(&restored), dir_size(&src));
    }

    #[test]
    fn test_content_size_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = corpus(dir.path());
        let expected = dir_size(&src);

        let tar = dir.path().join("out.tar");
        TarArchiver.compress(&src, &tar, false).unwrap();
        assert_eq!(TarArchiver.content_size(&tar).unwrap(), expected);

        let zip = dir.path().join("out.zip");
        ZipArchiver.compress(&src, &zip, false).unwrap();
        assert_eq!(ZipArchiver.content_size(&zip).unwrap(), expected);
    }

    #[test]
    fn test_null_archiver_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("folder");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("data.csv"), vec![9u8; 2048]).unwrap();

        let archive = dir.path().join("out.bin");
        assert_eq!(NullArchiver.estimate_compressed_size(&src).unwrap(), 2048);
        assert!(NullArchiver.compress(&src, &archive, false).unwrap());

        let restored = dir.path().join("restored");
        NullArchiver.extract(&archive, &restored).unwrap();
        assert_eq!(fs::read(restored.join(NULL_ARCHIVE_ENTRY)).unwrap(), vec![9u8; 2048]);

        fs::write(src.join("other.csv"), b"x").unwrap();
        assert!(NullArchiver.compress(&src, &archive, false).is_err());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(!TarArchiver.compress(&missing, &dir.path().join("x.tar"), false).unwrap());
        assert!(TarArchiver.is_supported(Path::new("a.tar")));
        assert!(!TarArchiver.is_supported(Path::new("a.zip")));
    }
}
