//! 파일 시스템 서비스
//!
//! 세션 로직이 쓰는 파일 시스템 기능을 trait으로 묶는다.
//! 수정 시각은 플랫폼과 무관하게 epoch 기준 초로 다룬다.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::Result;

/// 파일 시스템 기능
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    /// 링크 자체가 심볼릭 링크인지 (따라가지 않음)
    fn is_symlink(&self, path: &Path) -> bool;

    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    /// 경로가 속한 볼륨의 사용 가능 공간 (바이트)
    fn available_space(&self, path: &Path) -> Result<u64>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// 수정 시각 (epoch 초)
    fn modified_secs(&self, path: &Path) -> Result<u64>;

    fn set_modified_secs(&self, path: &Path, secs: u64) -> Result<()>;

    /// 쓰기용 파일 생성 (기존 내용은 버림)
    fn create_file(&self, path: &Path) -> Result<File>;

    /// 읽기용 파일 열기
    fn open_file(&self, path: &Path) -> Result<File>;

    /// 디렉토리 재귀 나열 (전위 순회, 이름순, 디렉토리 링크는 따라가지 않음)
    fn walk_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// std::fs 기반 구현
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        path.symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        Ok(std::fs::read_link(path)?)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn available_space(&self, path: &Path) -> Result<u64> {
        Ok(available_space(path)?)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        Ok(std::fs::create_dir_all(path)?)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(std::fs::rename(from, to)?)
    }

    fn modified_secs(&self, path: &Path) -> Result<u64> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0))
    }

    fn set_modified_secs(&self, path: &Path, secs: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))?;
        Ok(())
    }

    fn create_file(&self, path: &Path) -> Result<File> {
        Ok(File::create(path)?)
    }

    fn open_file(&self, path: &Path) -> Result<File> {
        Ok(File::open(path)?)
    }

    fn walk_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        walk(path, &mut out)?;
        Ok(out)
    }
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for entry in entries {
        let is_real_dir = entry
            .symlink_metadata()
            .map(|m| m.file_type().is_dir())
            .unwrap_or(false);
        out.push(entry.clone());
        if is_real_dir {
            walk(&entry, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn available_space(path: &Path) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn available_space(path: &Path) -> io::Result<u64> {
    std::fs::metadata(path)?;
    Ok(u64::MAX)
}

/// 파일 시스템을 건드리지 않고 `.`/`..` 정리
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 상대 경로를 현재 작업 디렉토리 기준 절대 경로로 정규화
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    let normalized = normalize_lexically(path);
    if normalized.is_absolute() {
        Ok(normalized)
    } else {
        Ok(normalize_lexically(&std::env::current_dir()?.join(normalized)))
    }
}

/// SystemTime -> epoch 초
pub fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize_lexically(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize_lexically(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(normalize_lexically(Path::new("a/b/")), PathBuf::from("a/b"));
    }

    #[test]
    fn test_absolutize() {
        let abs = absolutize(Path::new("x/../y")).unwrap();
        assert!(abs.is_absolute());
        assert!(abs.ends_with("y"));
    }

    #[test]
    fn test_local_file_system_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new();

        let nested = dir.path().join("a/b");
        fs.create_dir_all(&nested).unwrap();
        assert!(fs.is_dir(&nested));

        let file_path = nested.join("data.bin");
        {
            let mut file = fs.create_file(&file_path).unwrap();
            file.write_all(b"hello").unwrap();
        }
        assert!(fs.is_file(&file_path));
        assert_eq!(fs.file_size(&file_path).unwrap(), 5);

        fs.set_modified_secs(&file_path, 1_600_000_000).unwrap();
        assert_eq!(fs.modified_secs(&file_path).unwrap(), 1_600_000_000);

        let moved = dir.path().join("moved.bin");
        fs.rename(&file_path, &moved).unwrap();
        assert!(!fs.exists(&file_path));
        assert!(fs.exists(&moved));

        assert!(fs.available_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_walk_dir_is_preorder_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("b/inner")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b/inner/c.txt"), b"c").unwrap();
        std::fs::write(root.join("b/z.txt"), b"z").unwrap();

        let listed: Vec<PathBuf> = LocalFileSystem
            .walk_dir(root)
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();

        assert_eq!(
            listed,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b"),
                PathBuf::from("b/inner"),
                PathBuf::from("b/inner/c.txt"),
                PathBuf::from("b/z.txt"),
            ]
        );
    }
}
