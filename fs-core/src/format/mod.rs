//! MINIX V2/V3 on-disk format: superblock, inode and directory entry codecs,
//! and `format_device` for creating an empty filesystem.
//!
//! All multi-byte fields are stored in the byte order of the machine that
//! made the filesystem. A filesystem written on a little-endian machine is
//! "native"; one whose magic reads byte-swapped is decoded big-endian.

use arrayref::array_ref;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Byte offset of the superblock from the start of the device
pub const SUPER_OFFSET: u64 = 1024;
/// Bytes of the superblock that live on disk
pub const SUPER_DISK_SIZE: usize = 31;

/// V1 magic (16-bit zone numbers, not supported)
pub const SUPER_V1: u16 = 0x137F;
/// V1 magic read on a machine of the other byte order
pub const SUPER_V1_REV: u16 = 0x7F13;
/// V2 magic
pub const SUPER_V2: u16 = 0x2468;
/// V2 magic read on a machine of the other byte order
pub const SUPER_V2_REV: u16 = 0x6824;
/// V3 magic
pub const SUPER_V3: u16 = 0x4D5A;
/// V3 magic read on a machine of the other byte order
pub const SUPER_V3_REV: u16 = 0x5A4D;

/// `s_flags`: filesystem was unmounted (or checked) cleanly
pub const FLAG_CLEAN: u16 = 1 << 0;
/// `s_flags`: feature bits a checker must understand before touching the filesystem
pub const FLAG_MANDATORY_MASK: u16 = 0xFF00;

/// Inode number of the root directory
pub const ROOT_INODE: u32 = 1;
/// Block number of the inode bitmap
pub const IMAP_START: u64 = 2;

/// Direct zones in a V2/V3 inode
pub const NR_DZONES: usize = 7;
/// Total zone slots in a V2/V3 inode
pub const NR_TZONES: usize = 10;
/// Slot of the single-indirect zone
pub const SINGLE_INDIRECT: usize = 7;
/// Slot of the double-indirect zone
pub const DOUBLE_INDIRECT: usize = 8;
/// Slot of the triple-indirect zone, which the format never uses
pub const TRIPLE_INDIRECT: usize = 9;
/// Size of a zone number on disk
pub const ZONE_NUM_SIZE: usize = 4;

/// Size of a V2/V3 on-disk inode
pub const INODE_SIZE: usize = 64;
/// Maximum length of a directory entry name
pub const NAME_MAX: usize = 60;
/// Size of a directory entry
pub const DIR_ENTRY_SIZE: usize = 4 + NAME_MAX;

/// File type mask of `i_mode`
pub const I_TYPE: u16 = 0o170000;
pub const I_REGULAR: u16 = 0o100000;
pub const I_DIRECTORY: u16 = 0o040000;
pub const I_BLOCK_SPECIAL: u16 = 0o060000;
pub const I_CHAR_SPECIAL: u16 = 0o020000;
pub const I_NAMED_PIPE: u16 = 0o010000;
pub const I_SYMBOLIC_LINK: u16 = 0o120000;
pub const I_UNIX_SOCKET: u16 = 0o140000;

/// Error type for on-disk format operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Bad magic number 0x{0:04x}")]
    InvalidMagic(u16),
    #[error("Unsupported filesystem version: V{0}")]
    UnsupportedVersion(u8),
    #[error("Device of {0} bytes is too small for a filesystem")]
    TooSmall(u64),
    #[error("Invalid format parameter: {0}")]
    InvalidParameter(String),
}

/// Byte order of the filesystem's multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    /// Written on a little-endian machine (the native MINIX order)
    Little,
    /// Written on a big-endian machine
    Big,
}

impl Endian {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], n: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(buf, n),
            Endian::Big => BigEndian::write_u16(buf, n),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], n: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, n),
            Endian::Big => BigEndian::write_u32(buf, n),
        }
    }
}

/// Filesystem format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Version {
    V2,
    V3,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V2 => write!(f, "V2"),
            Version::V3 => write!(f, "V3"),
        }
    }
}

/// Identify version and byte order from the raw superblock bytes.
pub fn detect_magic(buf: &[u8]) -> Result<(Version, Endian), FormatError> {
    let magic = LittleEndian::read_u16(&buf[24..26]);
    match magic {
        SUPER_V3 => Ok((Version::V3, Endian::Little)),
        SUPER_V3_REV => Ok((Version::V3, Endian::Big)),
        SUPER_V2 => Ok((Version::V2, Endian::Little)),
        SUPER_V2_REV => Ok((Version::V2, Endian::Big)),
        SUPER_V1 | SUPER_V1_REV => Err(FormatError::UnsupportedVersion(1)),
        other => Err(FormatError::InvalidMagic(other)),
    }
}

/// The on-disk part of the superblock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawSuperblock {
    pub ninodes: u32,
    pub nzones_v1: u16,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    pub first_data_zone_old: u16,
    pub log_zone_size: u16,
    pub flags: u16,
    pub max_size: u32,
    pub zones: u32,
    pub magic: u16,
    pub block_size: u16,
    pub disk_version: u8,
}

impl RawSuperblock {
    /// Decode the superblock fields from the bytes at [`SUPER_OFFSET`]
    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        let raw = array_ref!(buf, 0, SUPER_DISK_SIZE);
        Self {
            ninodes: endian.read_u32(&raw[0..4]),
            nzones_v1: endian.read_u16(&raw[4..6]),
            imap_blocks: endian.read_u16(&raw[6..8]),
            zmap_blocks: endian.read_u16(&raw[8..10]),
            first_data_zone_old: endian.read_u16(&raw[10..12]),
            log_zone_size: endian.read_u16(&raw[12..14]),
            flags: endian.read_u16(&raw[14..16]),
            max_size: endian.read_u32(&raw[16..20]),
            zones: endian.read_u32(&raw[20..24]),
            magic: endian.read_u16(&raw[24..26]),
            block_size: endian.read_u16(&raw[28..30]),
            disk_version: raw[30],
        }
    }

    /// Encode into the first [`SUPER_DISK_SIZE`] bytes of `buf`
    pub fn encode(&self, buf: &mut [u8], endian: Endian) {
        let raw = &mut buf[..SUPER_DISK_SIZE];
        endian.write_u32(&mut raw[0..4], self.ninodes);
        endian.write_u16(&mut raw[4..6], self.nzones_v1);
        endian.write_u16(&mut raw[6..8], self.imap_blocks);
        endian.write_u16(&mut raw[8..10], self.zmap_blocks);
        endian.write_u16(&mut raw[10..12], self.first_data_zone_old);
        endian.write_u16(&mut raw[12..14], self.log_zone_size);
        endian.write_u16(&mut raw[14..16], self.flags);
        endian.write_u32(&mut raw[16..20], self.max_size);
        endian.write_u32(&mut raw[20..24], self.zones);
        endian.write_u16(&mut raw[24..26], self.magic);
        endian.write_u16(&mut raw[26..28], 0);
        endian.write_u16(&mut raw[28..30], self.block_size);
        raw[30] = self.disk_version;
    }
}

/// Type of an inode, from the top bits of its mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InodeType {
    Regular,
    Directory,
    BlockSpecial,
    CharSpecial,
    Pipe,
    Symlink,
    Socket,
    Bad,
}

impl InodeType {
    pub fn from_mode(mode: u16) -> Self {
        match mode & I_TYPE {
            I_REGULAR => InodeType::Regular,
            I_DIRECTORY => InodeType::Directory,
            I_BLOCK_SPECIAL => InodeType::BlockSpecial,
            I_CHAR_SPECIAL => InodeType::CharSpecial,
            I_NAMED_PIPE => InodeType::Pipe,
            I_SYMBOLIC_LINK => InodeType::Symlink,
            I_UNIX_SOCKET => InodeType::Socket,
            _ => InodeType::Bad,
        }
    }

    /// Character used in `ls -l` style listings
    pub fn symbol(self) -> char {
        match self {
            InodeType::Regular => '-',
            InodeType::Directory => 'd',
            InodeType::BlockSpecial => 'b',
            InodeType::CharSpecial => 'c',
            InodeType::Pipe => 'p',
            InodeType::Symlink => 'l',
            InodeType::Socket => 's',
            InodeType::Bad => '?',
        }
    }
}

/// On-disk V2/V3 inode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskInode {
    /// File type and permission bits
    pub mode: u16,
    /// Number of directory entries naming this inode
    pub nlinks: u16,
    pub uid: u16,
    pub gid: u16,
    /// Size in bytes
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Direct zones, then single, double and triple indirect
    pub zones: [u32; NR_TZONES],
}

impl DiskInode {
    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        let raw = array_ref!(buf, 0, INODE_SIZE);
        let mut zones = [0u32; NR_TZONES];
        for (i, zone) in zones.iter_mut().enumerate() {
            let at = 24 + i * ZONE_NUM_SIZE;
            *zone = endian.read_u32(&raw[at..at + ZONE_NUM_SIZE]);
        }
        Self {
            mode: endian.read_u16(&raw[0..2]),
            nlinks: endian.read_u16(&raw[2..4]),
            uid: endian.read_u16(&raw[4..6]),
            gid: endian.read_u16(&raw[6..8]),
            size: endian.read_u32(&raw[8..12]),
            atime: endian.read_u32(&raw[12..16]),
            mtime: endian.read_u32(&raw[16..20]),
            ctime: endian.read_u32(&raw[20..24]),
            zones,
        }
    }

    pub fn encode(&self, buf: &mut [u8], endian: Endian) {
        let raw = &mut buf[..INODE_SIZE];
        endian.write_u16(&mut raw[0..2], self.mode);
        endian.write_u16(&mut raw[2..4], self.nlinks);
        endian.write_u16(&mut raw[4..6], self.uid);
        endian.write_u16(&mut raw[6..8], self.gid);
        endian.write_u32(&mut raw[8..12], self.size);
        endian.write_u32(&mut raw[12..16], self.atime);
        endian.write_u32(&mut raw[16..20], self.mtime);
        endian.write_u32(&mut raw[20..24], self.ctime);
        for (i, zone) in self.zones.iter().enumerate() {
            let at = 24 + i * ZONE_NUM_SIZE;
            endian.write_u32(&mut raw[at..at + ZONE_NUM_SIZE], *zone);
        }
    }

    pub fn file_type(&self) -> InodeType {
        InodeType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & I_TYPE == I_DIRECTORY
    }

    /// A mode of zero marks a free inode
    pub fn is_allocated(&self) -> bool {
        self.mode != 0
    }

    pub fn has_zeroed_times(&self) -> bool {
        self.atime == 0 && self.mtime == 0 && self.ctime == 0
    }
}

/// On-disk directory entry
#[derive(Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number, 0 for a free slot
    pub inode: u32,
    /// NUL-padded name
    pub name: [u8; NAME_MAX],
}

impl DirEntry {
    pub fn new(inode: u32, name: &[u8]) -> Self {
        let mut raw = [0u8; NAME_MAX];
        let len = name.len().min(NAME_MAX);
        raw[..len].copy_from_slice(&name[..len]);
        Self { inode, name: raw }
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        let raw = array_ref!(buf, 0, DIR_ENTRY_SIZE);
        Self {
            inode: endian.read_u32(&raw[0..4]),
            name: *array_ref!(raw, 4, NAME_MAX),
        }
    }

    pub fn encode(&self, buf: &mut [u8], endian: Endian) {
        let raw = &mut buf[..DIR_ENTRY_SIZE];
        endian.write_u32(&mut raw[0..4], self.inode);
        raw[4..].copy_from_slice(&self.name);
    }

    /// Name bytes up to the first NUL
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    /// Printable form of the name
    pub fn display_name(&self) -> String {
        self.name_bytes()
            .iter()
            .flat_map(|&b| std::ascii::escape_default(b))
            .map(char::from)
            .collect()
    }

    pub fn is_free(&self) -> bool {
        self.inode == 0
    }

    pub fn is_dot(&self) -> bool {
        self.name_bytes() == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name_bytes() == b".."
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("inode", &self.inode)
            .field("name", &self.display_name())
            .finish()
    }
}

/// Parameters for [`format_device`]
#[derive(Debug, Clone)]
pub struct FormatParams {
    /// Block size in bytes (power of two, 1 KiB to 64 KiB)
    pub block_size: usize,
    /// Number of inodes; `None` picks one inode per four blocks
    pub inodes: Option<u32>,
    /// Byte order to write the filesystem in
    pub endian: Endian,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inodes: None,
            endian: Endian::Little,
        }
    }
}

/// Summary of a freshly made filesystem
#[derive(Debug, Clone, Serialize)]
pub struct FormatSummary {
    pub block_size: usize,
    pub inodes: u32,
    pub zones: u32,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    pub first_data_zone: u32,
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Make an empty V3 filesystem on `device`: boot block, superblock, bitmaps,
/// inode table and a root directory holding `.` and `..`.
pub async fn format_device(
    device: &dyn BlockDevice,
    params: &FormatParams,
) -> Result<FormatSummary, FormatError> {
    let bs = params.block_size;
    if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
        return Err(FormatError::InvalidParameter(format!(
            "block size {} is not a power of two between {} and {}",
            bs, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }

    let blocks = device.size() / bs as u64;
    let zones = u32::try_from(blocks)
        .map_err(|_| FormatError::InvalidParameter(format!("{} blocks is too many", blocks)))?;
    let inodes = params
        .inodes
        .unwrap_or_else(|| (zones / 4).max(16))
        .max(1);

    let bits_per_block = (bs * 8) as u64;
    let inodes_per_block = (bs / INODE_SIZE) as u64;
    let imap_blocks = div_ceil(inodes as u64 + 1, bits_per_block);
    let zmap_blocks = div_ceil(zones as u64 + 1, bits_per_block);
    let inode_blocks = div_ceil(inodes as u64, inodes_per_block);
    let first_data_zone = IMAP_START + imap_blocks + zmap_blocks + inode_blocks;
    let map_blocks = |blocks: u64, what: &str| {
        u16::try_from(blocks).map_err(|_| {
            FormatError::InvalidParameter(format!("{} needs {} blocks, at most 65535", what, blocks))
        })
    };
    let imap_blocks_raw = map_blocks(imap_blocks, "inode bitmap")?;
    let zmap_blocks_raw = map_blocks(zmap_blocks, "zone bitmap")?;

    // Room for the root directory block at least
    if first_data_zone + 1 > blocks {
        return Err(FormatError::TooSmall(device.size()));
    }

    let nindirs = (bs / ZONE_NUM_SIZE) as u64;
    let max_zones = NR_DZONES as u64 + nindirs + nindirs * nindirs;
    let max_size = (max_zones * bs as u64).min(i32::MAX as u64) as u32;

    let raw = RawSuperblock {
        ninodes: inodes,
        nzones_v1: 0,
        imap_blocks: imap_blocks_raw,
        zmap_blocks: zmap_blocks_raw,
        // 0 when it does not fit; readers then derive it from the other fields
        first_data_zone_old: u16::try_from(first_data_zone).unwrap_or(0),
        log_zone_size: 0,
        flags: FLAG_CLEAN,
        max_size,
        zones,
        magic: SUPER_V3,
        block_size: bs as u16,
        disk_version: 0,
    };

    let endian = params.endian;
    let zero = vec![0u8; bs];

    // Wipe the metadata area
    for block in 0..first_data_zone + 1 {
        device.write_at(block * bs as u64, &zero).await?;
    }

    let mut sb = vec![0u8; SUPER_DISK_SIZE];
    raw.encode(&mut sb, endian);
    device.write_at(SUPER_OFFSET, &sb).await?;

    // Bit 0 is reserved in both maps; bit 1 is the root inode / first data zone
    let mut chunk = [0u8; 4];
    endian.write_u32(&mut chunk, 0b11);
    device.write_at(IMAP_START * bs as u64, &chunk).await?;
    device
        .write_at((IMAP_START + imap_blocks) * bs as u64, &chunk)
        .await?;

    let now = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
    let mut root = DiskInode {
        mode: I_DIRECTORY | 0o755,
        nlinks: 2,
        uid: 0,
        gid: 0,
        size: (2 * DIR_ENTRY_SIZE) as u32,
        atime: now,
        mtime: now,
        ctime: now,
        zones: [0; NR_TZONES],
    };
    root.zones[0] = first_data_zone as u32;

    let inode_table = IMAP_START + imap_blocks + zmap_blocks;
    let mut ibuf = [0u8; INODE_SIZE];
    root.encode(&mut ibuf, endian);
    // Inode 1 is the first record of the table
    device.write_at(inode_table * bs as u64, &ibuf).await?;

    let mut dir_block = vec![0u8; bs];
    DirEntry::new(ROOT_INODE, b".").encode(&mut dir_block[..DIR_ENTRY_SIZE], endian);
    DirEntry::new(ROOT_INODE, b"..").encode(&mut dir_block[DIR_ENTRY_SIZE..], endian);
    device.write_at(first_data_zone * bs as u64, &dir_block).await?;
    device.sync().await?;

    log::info!(
        "Formatted V3 filesystem: {} inodes, {} zones of {} bytes, first data zone {}",
        inodes,
        zones,
        bs,
        first_data_zone
    );

    Ok(FormatSummary {
        block_size: bs,
        inodes,
        zones,
        imap_blocks: imap_blocks_raw,
        zmap_blocks: zmap_blocks_raw,
        first_data_zone: first_data_zone as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    #[test]
    fn test_detect_magic() {
        let mut buf = [0u8; SUPER_DISK_SIZE];
        LittleEndian::write_u16(&mut buf[24..26], SUPER_V3);
        assert_eq!(detect_magic(&buf).unwrap(), (Version::V3, Endian::Little));

        BigEndian::write_u16(&mut buf[24..26], SUPER_V2);
        assert_eq!(detect_magic(&buf).unwrap(), (Version::V2, Endian::Big));

        LittleEndian::write_u16(&mut buf[24..26], SUPER_V1);
        assert!(matches!(
            detect_magic(&buf),
            Err(FormatError::UnsupportedVersion(1))
        ));

        LittleEndian::write_u16(&mut buf[24..26], 0xBEEF);
        assert!(matches!(
            detect_magic(&buf),
            Err(FormatError::InvalidMagic(0xBEEF))
        ));
    }

    #[test]
    fn test_inode_layout_is_byte_exact() {
        let mut inode = DiskInode {
            mode: I_REGULAR | 0o644,
            nlinks: 1,
            size: 0x01020304,
            ..Default::default()
        };
        inode.zones[9] = 0xAABBCCDD;

        let mut buf = [0u8; INODE_SIZE];
        inode.encode(&mut buf, Endian::Big);
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
        assert_eq!(&buf[60..64], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(DiskInode::decode(&buf, Endian::Big), inode);
    }

    #[test]
    fn test_dir_entry_names() {
        let entry = DirEntry::new(5, b"hello");
        assert_eq!(entry.name_bytes(), b"hello");
        assert!(!entry.is_dot());
        assert!(DirEntry::new(1, b".").is_dot());
        assert!(DirEntry::new(1, b"..").is_dotdot());
        assert_eq!(DirEntry::new(1, b"a/b\x01").display_name(), "a/b\\x01");

        let long = [b'x'; 80];
        assert_eq!(DirEntry::new(2, &long).name_bytes().len(), NAME_MAX);
    }

    #[test]
    fn test_inode_type_from_mode() {
        assert_eq!(InodeType::from_mode(I_DIRECTORY | 0o755), InodeType::Directory);
        assert_eq!(InodeType::from_mode(I_SYMBOLIC_LINK), InodeType::Symlink);
        assert_eq!(InodeType::from_mode(0o070000), InodeType::Bad);
    }

    /// Reports a size but holds no data
    struct SizedOnly(u64);

    #[async_trait::async_trait]
    impl BlockDevice for SizedOnly {
        async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> crate::blockdev::Result<()> {
            Ok(())
        }
        async fn write_at(&self, _offset: u64, _data: &[u8]) -> crate::blockdev::Result<()> {
            Err(BlockDeviceError::ReadOnly)
        }
        fn size(&self) -> u64 {
            self.0
        }
        async fn sync(&self) -> crate::blockdev::Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> crate::blockdev::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_format_rejects_oversized_bitmaps() {
        // 600 GiB of 1 KiB zones needs 76800 zone bitmap blocks
        let device = SizedOnly(600 << 30);
        let params = FormatParams {
            block_size: 1024,
            inodes: Some(64),
            endian: Endian::Little,
        };
        match format_device(&device, &params).await {
            Err(FormatError::InvalidParameter(msg)) => assert!(msg.contains("zone bitmap")),
            other => panic!("expected a parameter error, got {:?}", other.map(|s| s.zones)),
        }
    }

    #[tokio::test]
    async fn test_format_writes_root_directory() {
        let device = MemoryBlockDevice::new(64 * 1024);
        let params = FormatParams {
            block_size: 1024,
            inodes: Some(32),
            endian: Endian::Little,
        };
        let summary = format_device(&device, &params).await.unwrap();
        assert_eq!(summary.zones, 64);
        assert_eq!(summary.imap_blocks, 1);
        assert_eq!(summary.zmap_blocks, 1);
        // 32 inodes * 64 bytes = 2 blocks of inode table
        assert_eq!(summary.first_data_zone, 2 + 1 + 1 + 2);

        let image = device.snapshot();
        let (version, endian) = detect_magic(&image[1024..]).unwrap();
        assert_eq!((version, endian), (Version::V3, Endian::Little));
        let raw = RawSuperblock::decode(&image[1024..], endian);
        assert_eq!(raw.ninodes, 32);
        assert_eq!(raw.flags & FLAG_CLEAN, FLAG_CLEAN);

        let root = DiskInode::decode(&image[4 * 1024..], endian);
        assert!(root.is_dir());
        assert_eq!(root.nlinks, 2);
        assert_eq!(root.zones[0], summary.first_data_zone);

        let dir = &image[summary.first_data_zone as usize * 1024..];
        assert!(DirEntry::decode(dir, endian).is_dot());
        assert!(DirEntry::decode(&dir[DIR_ENTRY_SIZE..], endian).is_dotdot());
    }

    #[tokio::test]
    async fn test_format_rejects_tiny_device() {
        let device = MemoryBlockDevice::new(4 * 1024);
        let params = FormatParams {
            block_size: 1024,
            inodes: Some(16),
            endian: Endian::Little,
        };
        assert!(matches!(
            format_device(&device, &params).await,
            Err(FormatError::TooSmall(_))
        ));
    }
}
