use std::{env, process};

use imgfs::Filesystem;
use imgfs_types::{BLOCK_COUNT, BLOCK_SIZE, DATA_START_BLOCK, DISK_SIZE, INODE_COUNT};

fn main() {
    env_logger::init();

    let args = env::args().collect::<Vec<String>>();
    let [prog, image_file] = &args[..] else {
        let prog = args.first().map_or("mkfs", String::as_str);
        eprintln!("Usage: {prog} fs.img");
        process::exit(1);
    };

    let mut fs = match Filesystem::mount(image_file) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("{prog}: {image_file}: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = fs.flush() {
        eprintln!("{prog}: {image_file}: {err}");
        process::exit(1);
    }

    eprintln!(
        "{image_file}: {DISK_SIZE} bytes, {BLOCK_COUNT} blocks of {BLOCK_SIZE} \
         ({DATA_START_BLOCK} reserved), {INODE_COUNT} inodes"
    );
}
