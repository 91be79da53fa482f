use crate::{
    proto::{self, Directory, DirectoryNode, FileNode},
    Digest,
};
use lazy_static::lazy_static;

pub const HELLOWORLD_BLOB_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref DUMMY_DIGEST: Digest = Digest::new([0x00; 32], 0);
    pub static ref DUMMY_DIGEST_2: Digest = Digest::new([0x10; 32], 3);

    pub static ref HELLOWORLD_BLOB_DIGEST: Digest = Digest::of(HELLOWORLD_BLOB_CONTENTS);
    pub static ref EMPTY_BLOB_DIGEST: Digest = Digest::of(EMPTY_BLOB_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: Digest = Digest::of(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: Digest = Digest::of(&BLOB_B);

    // Directories
    pub static ref DIRECTORY_WITH_KEEP: proto::Directory = proto::Directory {
        files: vec![FileNode {
            name: ".keep".into(),
            digest: Some(EMPTY_BLOB_DIGEST.clone().into()),
            is_executable: false,
            node_properties: None,
        }],
        ..Default::default()
    };
    pub static ref DIRECTORY_COMPLICATED: proto::Directory = proto::Directory {
        directories: vec![DirectoryNode {
            name: "keep".into(),
            digest: Some(DIRECTORY_WITH_KEEP.digest().into()),
        }],
        files: vec![
            FileNode {
                name: ".keep".into(),
                digest: Some(EMPTY_BLOB_DIGEST.clone().into()),
                is_executable: false,
                node_properties: None,
            },
            FileNode {
                name: "hello".into(),
                digest: Some(HELLOWORLD_BLOB_DIGEST.clone().into()),
                is_executable: true,
                node_properties: None,
            },
        ],
        ..Default::default()
    };
    pub static ref DIRECTORY_A: Directory = Directory::default();
    pub static ref DIRECTORY_B: Directory = Directory {
        directories: vec![DirectoryNode {
            name: "a".into(),
            digest: Some(DIRECTORY_A.digest().into()),
        }],
        ..Default::default()
    };
}
