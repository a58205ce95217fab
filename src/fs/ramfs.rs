use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;
use lazy_static::lazy_static;

use super::dentry::DirEntry;
use super::error::{FsError, FsResult};
use super::inode::{FileType, Inode};
use super::mount::FileSystem;

/// An in-memory node (file or directory).
struct RamNode {
    inode: Inode,
    data: Vec<u8>,
    children: Vec<String>,
}

/// RAMFS — a fully in-memory filesystem.
pub struct RamFs {
    label: &'static str,
    nodes: Mutex<BTreeMap<String, RamNode>>,
    next_id: Mutex<u64>,
}

impl RamFs {
    pub fn new(label: &'static str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::from("/"), RamNode {
            inode: Inode { id: 0, file_type: FileType::Directory, size: 0 },
            data: Vec::new(),
            children: Vec::new(),
        });

        RamFs {
            label,
            nodes: Mutex::new(nodes),
            next_id: Mutex::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        let mut id = self.next_id.lock();
        let val = *id;
        *id += 1;
        val
    }

    fn parent_and_name(path: &str) -> (&str, &str) {
        let path = path.trim_end_matches('/');
        if path == "/" || path.is_empty() {
            return ("/", "");
        }
        match path.rfind('/') {
            Some(0) => ("/", &path[1..]),
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("/", path),
        }
    }

    fn normalize(path: &str) -> String {
        let p = if path.starts_with('/') { String::from(path) } else { alloc::format!("/{}", path) };
        if p.len() > 1 && p.ends_with('/') {
            String::from(p.trim_end_matches('/'))
        } else {
            p
        }
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &str {
        self.label
    }

    fn create(&self, path: &str) -> FsResult<Inode> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();

        if nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists);
        }

        let (parent, name) = Self::parent_and_name(&path);
        let parent_str = String::from(parent);

        let parent_node = nodes.get_mut(&parent_str).ok_or(FsError::NotFound)?;
        if parent_node.inode.file_type != FileType::Directory {
            return Err(FsError::NotADirectory);
        }
        parent_node.children.push(String::from(name));

        let id = self.alloc_id();
        let inode = Inode { id, file_type: FileType::File, size: 0 };
        nodes.insert(path, RamNode {
            inode: inode.clone(),
            data: Vec::new(),
            children: Vec::new(),
        });

        Ok(inode)
    }

    fn mkdir(&self, path: &str) -> FsResult<Inode> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();

        if nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists);
        }

        let (parent, name) = Self::parent_and_name(&path);
        let parent_str = String::from(parent);

        let parent_node = nodes.get_mut(&parent_str).ok_or(FsError::NotFound)?;
        if parent_node.inode.file_type != FileType::Directory {
            return Err(FsError::NotADirectory);
        }
        parent_node.children.push(String::from(name));

        let id = self.alloc_id();
        let inode = Inode { id, file_type: FileType::Directory, size: 0 };
        nodes.insert(path, RamNode {
            inode: inode.clone(),
            data: Vec::new(),
            children: Vec::new(),
        });

        Ok(inode)
    }

    fn lookup(&self, path: &str) -> FsResult<Inode> {
        let path = Self::normalize(path);
        let nodes = self.nodes.lock();
        nodes.get(&path)
            .map(|n| n.inode.clone())
            .ok_or(FsError::NotFound)
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let path = Self::normalize(path);
        let nodes = self.nodes.lock();
        let node = nodes.get(&path).ok_or(FsError::NotFound)?;

        if node.inode.file_type == FileType::Directory {
            return Err(FsError::IsADirectory);
        }

        if offset >= node.data.len() {
            return Ok(0);
        }

        let available = &node.data[offset..];
        let to_read = buf.len().min(available.len());
        buf[..to_read].copy_from_slice(&available[..to_read]);
        Ok(to_read)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> FsResult<usize> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&path).ok_or(FsError::NotFound)?;

        if node.inode.file_type == FileType::Directory {
            return Err(FsError::IsADirectory);
        }

        let end = offset + data.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        node.inode.size = node.data.len();

        Ok(data.len())
    }

    fn truncate(&self, path: &str) -> FsResult<()> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&path).ok_or(FsError::NotFound)?;

        if node.inode.file_type == FileType::Directory {
            return Err(FsError::IsADirectory);
        }

        node.data.clear();
        node.inode.size = 0;
        Ok(())
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = Self::normalize(path);
        let nodes = self.nodes.lock();
        let node = nodes.get(&path).ok_or(FsError::NotFound)?;

        if node.inode.file_type != FileType::Directory {
            return Err(FsError::NotADirectory);
        }

        let mut entries = Vec::new();
        for child_name in &node.children {
            let child_path = if path == "/" {
                alloc::format!("/{}", child_name)
            } else {
                alloc::format!("{}/{}", path, child_name)
            };
            if let Some(child_node) = nodes.get(&child_path) {
                entries.push(DirEntry {
                    name: child_name.clone(),
                    inode: child_node.inode.clone(),
                });
            }
        }

        Ok(entries)
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let path = Self::normalize(path);
        if path == "/" {
            return Err(FsError::InvalidPath);
        }

        let mut nodes = self.nodes.lock();

        if let Some(node) = nodes.get(&path) {
            if node.inode.file_type == FileType::Directory && !node.children.is_empty() {
                return Err(FsError::IsADirectory);
            }
        } else {
            return Err(FsError::NotFound);
        }

        let (parent, name) = Self::parent_and_name(&path);
        let parent_str = String::from(parent);
        if let Some(parent_node) = nodes.get_mut(&parent_str) {
            parent_node.children.retain(|c| c != name);
        }

        nodes.remove(&path);
        Ok(())
    }
}

lazy_static! {
    pub static ref RAMFS_INSTANCE: RamFs = RamFs::new("ramfs");
    pub static ref TMPFS_INSTANCE: RamFs = RamFs::new("tmpfs");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_exists_and_is_a_directory() {
        let fs = RamFs::new("t");
        let root = fs.lookup("/").unwrap();
        assert_eq!(root.file_type, FileType::Directory);
    }

    #[test]
    fn create_then_lookup_finds_a_file() {
        let fs = RamFs::new("t");
        let inode = fs.create("/foo").unwrap();
        assert_eq!(inode.file_type, FileType::File);
        assert_eq!(fs.lookup("/foo").unwrap().id, inode.id);
    }

    #[test]
    fn create_twice_is_already_exists() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        assert!(matches!(fs.create("/foo"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn create_under_missing_parent_is_not_found() {
        let fs = RamFs::new("t");
        assert!(matches!(fs.create("/missing/foo"), Err(FsError::NotFound)));
    }

    #[test]
    fn create_under_a_file_is_not_a_directory() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        assert!(matches!(fs.create("/foo/bar"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        let n = fs.write("/foo", 0, b"hello").unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let n = fs.read("/foo", 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_past_current_end_zero_fills_the_gap() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        fs.write("/foo", 3, b"x").unwrap();

        let mut buf = [0xffu8; 4];
        let n = fs.read("/foo", 0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, &[0, 0, 0, b'x']);
    }

    #[test]
    fn truncate_clears_existing_content() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        fs.write("/foo", 0, b"hello").unwrap();
        fs.truncate("/foo").unwrap();

        assert_eq!(fs.lookup("/foo").unwrap().size, 0);
        let mut buf = [0xffu8; 5];
        let n = fs.read("/foo", 0, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn truncate_on_a_directory_is_a_directory() {
        let fs = RamFs::new("t");
        fs.mkdir("/dir").unwrap();
        assert!(matches!(fs.truncate("/dir"), Err(FsError::IsADirectory)));
    }

    #[test]
    fn read_past_end_of_file_returns_zero() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        fs.write("/foo", 0, b"hi").unwrap();

        let mut buf = [0u8; 4];
        let n = fs.read("/foo", 10, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn read_and_write_on_a_directory_fail() {
        let fs = RamFs::new("t");
        fs.mkdir("/dir").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(fs.read("/dir", 0, &mut buf), Err(FsError::IsADirectory)));
        assert!(matches!(fs.write("/dir", 0, b"x"), Err(FsError::IsADirectory)));
    }

    #[test]
    fn readdir_lists_children_of_a_directory() {
        let fs = RamFs::new("t");
        fs.mkdir("/dir").unwrap();
        fs.create("/dir/a").unwrap();
        fs.create("/dir/b").unwrap();

        let mut names: Vec<String> = fs.readdir("/dir").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, alloc::vec![String::from("a"), String::from("b")]);
    }

    #[test]
    fn readdir_on_a_file_is_not_a_directory() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        assert!(matches!(fs.readdir("/foo"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn unlink_removes_a_file_and_its_directory_entry() {
        let fs = RamFs::new("t");
        fs.create("/foo").unwrap();
        fs.unlink("/foo").unwrap();
        assert!(matches!(fs.lookup("/foo"), Err(FsError::NotFound)));
        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn unlink_nonempty_directory_fails() {
        let fs = RamFs::new("t");
        fs.mkdir("/dir").unwrap();
        fs.create("/dir/a").unwrap();
        assert!(matches!(fs.unlink("/dir"), Err(FsError::IsADirectory)));
    }

    #[test]
    fn unlink_root_is_rejected() {
        let fs = RamFs::new("t");
        assert!(matches!(fs.unlink("/"), Err(FsError::InvalidPath)));
    }

    #[test]
    fn paths_without_a_leading_slash_are_normalized() {
        let fs = RamFs::new("t");
        fs.create("foo").unwrap();
        assert!(fs.lookup("/foo").is_ok());
    }

    #[test]
    fn trailing_slash_is_normalized_away() {
        let fs = RamFs::new("t");
        fs.mkdir("/dir").unwrap();
        assert!(fs.lookup("/dir/").is_ok());
    }
}
