//! End-to-end scenarios, each against a fresh image.

use std::path::PathBuf;

use imgfs::{Error, Filesystem};
use imgfs_types::{BLOCK_SIZE, FileMode};

const FILE_MODE: u32 = 0o100_644;

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    (dir, path)
}

fn mounted() -> (tempfile::TempDir, Filesystem) {
    let (dir, path) = scratch();
    let fs = Filesystem::mount(&path).unwrap();
    (dir, fs)
}

#[test]
fn create_write_read_round_trip() {
    let (_dir, mut fs) = mounted();

    fs.mknod("/hello", FILE_MODE, 0).unwrap();
    assert_eq!(fs.write("/hello", b"hello\n", 0).unwrap(), 6);

    let st = fs.stat("/hello").unwrap();
    assert_eq!(st.size, 6);
    assert_eq!(st.blocks, 1);
    assert_eq!(st.blksize, u32::try_from(BLOCK_SIZE).unwrap());
    assert_eq!(st.nlink, 1);

    let mut buf = [0_u8; 16];
    assert_eq!(fs.read("/hello", &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf[..6], b"hello\n");
}

#[test]
fn multi_block_write_via_the_indirect_block() {
    let (_dir, mut fs) = mounted();
    let payload = vec![0x5a_u8; 10_000];

    fs.mknod("/big", FILE_MODE, 0).unwrap();
    assert_eq!(fs.write("/big", &payload, 0).unwrap(), 10_000);
    assert_eq!(fs.stat("/big").unwrap().size, 10_000);
    assert_eq!(fs.stat("/big").unwrap().blocks, 3);

    let mut buf = vec![0_u8; 10_000];
    assert_eq!(fs.read("/big", &mut buf, 0).unwrap(), 10_000);
    assert_eq!(buf, payload);
}

#[test]
fn truncate_down_then_up_exposes_zeros() {
    let (_dir, mut fs) = mounted();
    let payload = vec![0x5a_u8; 10_000];
    fs.mknod("/big", FILE_MODE, 0).unwrap();
    fs.write("/big", &payload, 0).unwrap();

    fs.truncate("/big", 100).unwrap();
    assert_eq!(fs.stat("/big").unwrap().size, 100);

    fs.truncate("/big", 8_000).unwrap();
    let mut buf = vec![0_u8; 8_000];
    assert_eq!(fs.read("/big", &mut buf, 0).unwrap(), 8_000);
    assert_eq!(&buf[..100], &payload[..100]);
    assert!(buf[100..].iter().all(|&b| b == 0));
}

#[test]
fn hard_link_shares_the_inode_until_the_last_unlink() {
    let (_dir, mut fs) = mounted();

    fs.mknod("/a", FILE_MODE, 0).unwrap();
    fs.link("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().nlink, 2);
    assert_eq!(fs.stat("/b").unwrap().nlink, 2);
    assert_eq!(fs.stat("/a").unwrap().ino, fs.stat("/b").unwrap().ino);

    fs.write("/a", b"x", 0).unwrap();
    let mut buf = [0_u8; 4];
    assert_eq!(fs.read("/b", &mut buf, 0).unwrap(), 1);
    assert_eq!(buf[0], b'x');

    fs.unlink("/a").unwrap();
    assert!(matches!(fs.stat("/a"), Err(Error::NotFound)));
    assert_eq!(fs.stat("/b").unwrap().nlink, 1);
    assert_eq!(fs.read("/b", &mut buf, 0).unwrap(), 1);
    assert_eq!(buf[0], b'x');
}

#[test]
fn listing_after_mixed_operations() {
    let (_dir, mut fs) = mounted();

    fs.mkdir("/d", 0o755).unwrap();
    fs.mknod("/d/f1", FILE_MODE, 0).unwrap();
    fs.mknod("/d/f2", FILE_MODE, 0).unwrap();
    fs.unlink("/d/f1").unwrap();

    let entries = fs.read_dir("/d").unwrap();
    let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, [".", "f2"]);

    for entry in &entries {
        let expect = if entry.name == "." {
            fs.stat("/d").unwrap()
        } else {
            fs.stat(&format!("/d/{}", entry.name)).unwrap()
        };
        assert_eq!(entry.stat, expect);
    }
    assert!(matches!(fs.stat("/d/f1"), Err(Error::NotFound)));
}

#[test]
fn filling_the_image_reports_no_space_and_keeps_data() {
    let (_dir, mut fs) = mounted();
    let block = vec![0x42_u8; BLOCK_SIZE];

    fs.mknod("/keep", FILE_MODE, 0).unwrap();
    fs.write("/keep", b"survives", 0).unwrap();

    let mut created = 0_usize;
    let failure = loop {
        assert!(created < 1024, "image never filled up");
        let path = format!("/f{created}");
        fs.mknod(&path, FILE_MODE, 0).unwrap();
        match fs.write(&path, &block, 0) {
            Ok(n) => assert_eq!(n, BLOCK_SIZE),
            Err(err) => break err,
        }
        created += 1;
    };
    assert!(matches!(failure, Error::NoSpace));
    assert!(created > 0);

    // everything written before the well ran dry is still intact
    let mut buf = [0_u8; 8];
    assert_eq!(fs.read("/keep", &mut buf, 0).unwrap(), 8);
    assert_eq!(&buf, b"survives");
    let mut buf = vec![0_u8; BLOCK_SIZE];
    assert_eq!(fs.read("/f0", &mut buf, 0).unwrap(), BLOCK_SIZE);
    assert_eq!(buf, block);
    let last = format!("/f{}", created - 1);
    assert_eq!(fs.read(&last, &mut buf, 0).unwrap(), BLOCK_SIZE);
    assert_eq!(buf, block);
}

#[test]
fn content_persists_across_remount() {
    let (_dir, path) = scratch();

    {
        let mut fs = Filesystem::mount(&path).unwrap();
        fs.mkdir("/docs", 0o755).unwrap();
        fs.write("/docs/note", b"remember me", 0).unwrap();
        fs.chmod("/docs/note", FILE_MODE).unwrap();
        fs.flush().unwrap();
    }

    let fs = Filesystem::mount(&path).unwrap();
    let st = fs.stat("/docs/note").unwrap();
    assert_eq!(st.size, 11);
    assert_eq!(st.mode, FILE_MODE);

    let mut buf = [0_u8; 32];
    assert_eq!(fs.read("/docs/note", &mut buf, 0).unwrap(), 11);
    assert_eq!(&buf[..11], b"remember me");

    // a second mount must not have re-initialized the image
    assert_eq!(fs.read_dir("/").unwrap().len(), 2);
}

#[test]
fn nested_directories_resolve_segment_by_segment() {
    let (_dir, mut fs) = mounted();

    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    fs.mknod("/a/b/c", FILE_MODE, 0).unwrap();
    fs.write("/a/b/c", b"deep", 0).unwrap();

    assert!(FileMode::is_dir(fs.stat("/a/b").unwrap().mode));
    assert_eq!(fs.stat("//a///b/c").unwrap().size, 4);
    assert!(matches!(fs.stat("/a/x/c"), Err(Error::NotFound)));
    assert!(matches!(fs.stat("/a/b/c/d"), Err(Error::NotADirectory)));
}

#[test]
fn rmdir_takes_the_whole_subtree() {
    let (_dir, mut fs) = mounted();

    fs.mkdir("/top", 0o755).unwrap();
    fs.mkdir("/top/mid", 0o755).unwrap();
    fs.mkdir("/top/mid/leaf", 0o755).unwrap();
    fs.mknod("/top/f", FILE_MODE, 0).unwrap();
    fs.write("/top/mid/g", b"gone", 0).unwrap();
    fs.write("/top/mid/leaf/h", b"gone too", 0).unwrap();

    fs.rmdir("/top").unwrap();
    assert!(matches!(fs.stat("/top"), Err(Error::NotFound)));
    assert_eq!(fs.read_dir("/").unwrap().len(), 1);

    // the blocks and inodes all came back; the same tree fits again
    fs.mkdir("/top", 0o755).unwrap();
    fs.write("/top/f", b"fresh", 0).unwrap();
    assert_eq!(fs.stat("/top/f").unwrap().size, 5);
}

#[test]
fn rename_moves_the_entry_and_keeps_the_inode() {
    let (_dir, mut fs) = mounted();

    fs.mkdir("/src", 0o755).unwrap();
    fs.mkdir("/dst", 0o755).unwrap();
    fs.write("/src/f", b"payload", 0).unwrap();
    let before = fs.stat("/src/f").unwrap();

    fs.rename("/src/f", "/dst/g").unwrap();
    assert!(matches!(fs.stat("/src/f"), Err(Error::NotFound)));
    let after = fs.stat("/dst/g").unwrap();
    assert_eq!(after.ino, before.ino);
    assert_eq!(after.nlink, 1);
    assert_eq!(after.size, 7);

    fs.write("/src/f", b"other", 0).unwrap();
    assert!(matches!(
        fs.rename("/src/f", "/dst/g"),
        Err(Error::AlreadyExists)
    ));
}

#[test]
fn rmdir_on_a_deep_chain_does_not_recurse() {
    let (_dir, mut fs) = mounted();

    let mut path = String::new();
    for depth in 0..64 {
        path.push_str(&format!("/d{depth}"));
        fs.mkdir(&path, 0o755).unwrap();
    }
    fs.write(&format!("{path}/leaf"), b"bottom", 0).unwrap();

    fs.rmdir("/d0").unwrap();
    assert!(matches!(fs.stat("/d0"), Err(Error::NotFound)));
    assert_eq!(fs.read_dir("/").unwrap().len(), 1);
}

#[test]
fn links_outside_a_removed_tree_survive_it() {
    let (_dir, mut fs) = mounted();

    fs.mkdir("/d", 0o755).unwrap();
    fs.write("/d/f", b"shared", 0).unwrap();
    fs.link("/d/f", "/keep").unwrap();
    assert_eq!(fs.stat("/keep").unwrap().nlink, 2);

    fs.rmdir("/d").unwrap();
    let st = fs.stat("/keep").unwrap();
    assert_eq!(st.nlink, 1);

    let mut buf = [0_u8; 8];
    assert_eq!(fs.read("/keep", &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf[..6], b"shared");
}

#[test]
fn rename_within_one_directory_is_just_a_new_name() {
    let (_dir, mut fs) = mounted();

    fs.write("/old", b"same bytes", 0).unwrap();
    let before = fs.stat("/old").unwrap();
    fs.rename("/old", "/new").unwrap();

    assert!(matches!(fs.stat("/old"), Err(Error::NotFound)));
    let after = fs.stat("/new").unwrap();
    assert_eq!(after.ino, before.ino);
    assert_eq!(after.size, before.size);

    let names: Vec<String> = fs
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names.iter().filter(|n| *n == "new").count(), 1);
    assert!(!names.contains(&"old".to_owned()));
}

#[test]
fn hard_links_persist_across_remount() {
    let (_dir, path) = scratch();

    {
        let mut fs = Filesystem::mount(&path).unwrap();
        fs.write("/a", b"linked", 0).unwrap();
        fs.link("/a", "/b").unwrap();
        fs.flush().unwrap();
    }

    let mut fs = Filesystem::mount(&path).unwrap();
    assert_eq!(fs.stat("/a").unwrap().nlink, 2);
    assert_eq!(fs.stat("/a").unwrap().ino, fs.stat("/b").unwrap().ino);

    fs.unlink("/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().nlink, 1);
    let mut buf = [0_u8; 8];
    assert_eq!(fs.read("/a", &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf[..6], b"linked");
}

#[test]
fn write_creates_missing_files() {
    let (_dir, mut fs) = mounted();

    assert_eq!(fs.write("/implicit", b"made by write", 0).unwrap(), 13);
    let st = fs.stat("/implicit").unwrap();
    assert_eq!(st.size, 13);
    assert!(!FileMode::is_dir(st.mode));

    // offset writes extend the file and zero-fill the gap
    assert_eq!(fs.write("/implicit", b"!", 20).unwrap(), 1);
    let st = fs.stat("/implicit").unwrap();
    assert_eq!(st.size, 21);
    let mut buf = [0xff_u8; 32];
    assert_eq!(fs.read("/implicit", &mut buf, 0).unwrap(), 21);
    assert!(buf[13..20].iter().all(|&b| b == 0));
    assert_eq!(buf[20], b'!');
}

#[test]
fn reads_past_the_end_are_empty() {
    let (_dir, mut fs) = mounted();
    fs.write("/f", b"abc", 0).unwrap();

    let mut buf = [0_u8; 8];
    assert_eq!(fs.read("/f", &mut buf, 3).unwrap(), 0);
    assert_eq!(fs.read("/f", &mut buf, 100).unwrap(), 0);
    assert_eq!(fs.read("/f", &mut buf, 1).unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
}
