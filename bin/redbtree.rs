extern crate redbtree;
extern crate sha2;
extern crate structopt;

use std::error::Error;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use structopt::StructOpt;

use redbtree::{Key, Tree};

#[derive(Debug, StructOpt)]
#[structopt(name = "redbtree", about = "Inspect and edit a redbtree file")]
enum Command {
    /// Create a new, empty tree file.
    Create {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
    /// Insert a key, failing if it already exists.
    Put {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        key: String,
        value: String,
    },
    /// Insert a key, overwriting any existing value.
    Replace {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        key: String,
        value: String,
    },
    /// Look up a key and print its value.
    Get {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        key: String,
    },
    /// Print every key in ascending order.
    Dump {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
}

/// Hash an ASCII key into the fixed 16-byte key space: the low half of its
/// SHA-256 digest.
fn hash_key(text: &str) -> Key {
    let digest = Sha256::digest(text.as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[0..16]);
    key
}

fn main() -> Result<(), Box<dyn Error + 'static>> {
    env_logger::init();
    let command = Command::from_args();

    match command {
        Command::Create { file } => {
            Tree::create(&file)?;
            log::info!("created {}", file.display());
        }
        Command::Put { file, key, value } => {
            let mut tree = Tree::open_or_create(&file)?;
            tree.add(&hash_key(&key), value.as_bytes(), false)?;
        }
        Command::Replace { file, key, value } => {
            let mut tree = Tree::open_or_create(&file)?;
            tree.add(&hash_key(&key), value.as_bytes(), true)?;
        }
        Command::Get { file, key } => {
            let tree = Tree::open(&file)?;
            let value_off = tree.find(&hash_key(&key))?;
            let buf = tree.value_reader(value_off)?.read_to_vec()?;
            match std::str::from_utf8(&buf) {
                Ok(s) => println!("{}", s),
                Err(_) => println!("{:?}", buf),
            }
        }
        Command::Dump { file } => {
            let tree = Tree::open(&file)?;
            for (key, value_off) in tree.dump()? {
                let buf = tree.value_reader(value_off)?.read_to_vec()?;
                log::debug!("key {:?} at value offset {}", key, value_off);
                match std::str::from_utf8(&buf) {
                    Ok(s) => println!("{} {}", hex(&key), s),
                    Err(_) => println!("{} {:?}", hex(&key), buf),
                }
            }
        }
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
