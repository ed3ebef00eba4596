// src/fs/fat32.rs
//! FAT32 filesystem over a block device.
//!
//! Short (8.3) names only; no long-filename entries and no time fields.
//! Free clusters are discovered lazily: the FAT is scanned two sectors at a
//! time into a queue, and the scan resumes where it left off when the queue
//! runs dry.

use alloc::collections::VecDeque;
use alloc::string::String;

use log::debug;

use super::{BlockDevice, FileInfo, FileType, SeekFrom, SECTOR_SIZE};
use crate::errors::FsError;

const DIR_ENTRY_SIZE: usize = 32;
const DIR_NAME_LEN: usize = 11;
const DIR_ATTR: usize = 11;
const DIR_FST_CLUSTER_HIGH: usize = 20;
const DIR_FST_CLUSTER_LOW: usize = 26;
const DIR_FILE_SIZE: usize = 28;

/// First byte of a freed entry.
const DIR_FREE: u8 = 0xE5;
/// First byte marking "free, and everything after is free too".
const DIR_ALL_FREE: u8 = 0x00;

/// Directory attribute bit.
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Regular file attribute bit.
pub const ATTR_ARCHIVE: u8 = 0x20;

const CLUSTER_FREE: u32 = 0;
const CLUSTER_MASK: u32 = 0x0FFF_FFFF;
const CLUSTER_BAD: u32 = 0x0FFF_FFF7;
const CLUSTER_EOC: u32 = 0x0FFF_FFFF;

/// First cluster considered by the free scan (past the root).
const DATA_CLUSTER_START: u32 = 3;

/// FAT sectors consumed per free-list refill.
const FREE_CLUSTERS_SCANNED_SECTORS: u32 = 2;

const fn is_eoc(cluster: u32) -> bool {
    cluster & CLUSTER_MASK >= 0x0FFF_FFF8
}

/// One parsed directory entry, with its on-disk location.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub is_dir: bool,
    /// Sector holding the 32-byte entry
    pub sector: u64,
    /// Byte offset of the entry within that sector
    pub sector_offset: usize,
    /// First cluster of the containing directory; 0 marks the root itself
    pub parent_cluster: u32,
}

/// An open file or directory.
pub struct Fat32Handle {
    pub dirent: DirEntry,
    pub path: String,
    /// Byte position for files, entry index for directories
    pub pos: u32,
    pub is_dir: bool,
}

/// Mounted FAT32 volume.
pub struct Fat32<D: BlockDevice> {
    dev: D,
    mount: String,
    bytes_per_sec: u32,
    sec_per_clus: u32,
    rsvd_sec_cnt: u32,
    num_fats: u32,
    root_clus: u32,
    tot_sec32: u32,
    fat_sz32: u32,
    first_data_sector: u32,
    total_clusters: u32,
    free_clusters: VecDeque<u32>,
    scan_from: u32,
}

impl<D: BlockDevice> Fat32<D> {
    /// Parse the boot parameter block and prime the free-cluster queue.
    pub fn mount(dev: D, mount_point: &str) -> Result<Self, FsError> {
        let mut fs = Self {
            dev,
            mount: mount_point.to_uppercase(),
            bytes_per_sec: 0,
            sec_per_clus: 0,
            rsvd_sec_cnt: 0,
            num_fats: 0,
            root_clus: 0,
            tot_sec32: 0,
            fat_sz32: 0,
            first_data_sector: 0,
            total_clusters: 0,
            free_clusters: VecDeque::new(),
            scan_from: DATA_CLUSTER_START,
        };

        let mut bpb = [0u8; SECTOR_SIZE];
        fs.dev.read_block(0, &mut bpb)?;
        fs.parse_bpb(&bpb)?;
        fs.refill_free_clusters()?;
        debug!(
            "[Fat32] mounted {} ({} clusters, {} free discovered)",
            fs.mount,
            fs.total_clusters,
            fs.free_clusters.len()
        );
        Ok(fs)
    }

    fn parse_bpb(&mut self, bpb: &[u8; SECTOR_SIZE]) -> Result<(), FsError> {
        if bpb[510] != 0x55 || bpb[511] != 0xAA {
            return Err(FsError::InvalidBpb);
        }
        if !((bpb[0] == 0xEB && bpb[2] == 0x90) || bpb[0] == 0xE9) {
            return Err(FsError::InvalidBpb);
        }

        self.bytes_per_sec = u32::from(u16::from_le_bytes([bpb[11], bpb[12]]));
        self.sec_per_clus = u32::from(bpb[13]);
        self.rsvd_sec_cnt = u32::from(u16::from_le_bytes([bpb[14], bpb[15]]));
        self.num_fats = u32::from(bpb[16]);
        let root_ent_cnt = u16::from_le_bytes([bpb[17], bpb[18]]);
        self.tot_sec32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]);
        self.fat_sz32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]);
        self.root_clus = u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]);

        // FAT32 keeps the root directory in the data area.
        if root_ent_cnt != 0 || self.bytes_per_sec as usize != SECTOR_SIZE {
            return Err(FsError::InvalidBpb);
        }
        if self.sec_per_clus == 0 || self.fat_sz32 == 0 {
            return Err(FsError::InvalidBpb);
        }

        self.first_data_sector = self.rsvd_sec_cnt + self.num_fats * self.fat_sz32;
        self.total_clusters = self.tot_sec32 / self.sec_per_clus;
        Ok(())
    }

    fn root_dirent(&self) -> DirEntry {
        DirEntry {
            name: self.mount.clone(),
            attr: ATTR_DIRECTORY,
            first_cluster: self.root_clus,
            size: 0,
            is_dir: true,
            sector: 0,
            sector_offset: 0,
            parent_cluster: 0,
        }
    }

    fn first_sector_of_cluster(&self, cluster: u32) -> u64 {
        u64::from((cluster - 2) * self.sec_per_clus + self.first_data_sector)
    }

    fn fat_sector(&self, cluster: u32) -> u64 {
        u64::from(self.rsvd_sec_cnt + cluster * 4 / self.bytes_per_sec)
    }

    fn fat_offset(&self, cluster: u32) -> usize {
        (cluster * 4 % self.bytes_per_sec) as usize
    }

    // ------------------------------------------------------------------
    // FAT chain
    // ------------------------------------------------------------------

    fn get_next_cluster(&mut self, cluster: u32) -> Result<u32, FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.dev.read_block(self.fat_sector(cluster), &mut sector)?;
        let off = self.fat_offset(cluster);
        Ok(u32::from_le_bytes(sector[off..off + 4].try_into().unwrap()) & CLUSTER_MASK)
    }

    /// Last real cluster of a chain; 0 for an empty chain.
    fn get_last_cluster(&mut self, first: u32) -> Result<u32, FsError> {
        if first == CLUSTER_FREE {
            return Ok(0);
        }
        let mut current = first;
        loop {
            let next = self.get_next_cluster(current)?;
            if next == CLUSTER_FREE || is_eoc(next) {
                return Ok(current);
            }
            if next == CLUSTER_BAD {
                return Err(FsError::BadCluster);
            }
            current = next;
        }
    }

    fn write_fat(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        let lba = self.fat_sector(cluster);
        self.dev.read_block(lba, &mut sector)?;
        let off = self.fat_offset(cluster);
        sector[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.dev.write_block(lba, &sector)
    }

    /// Scan forward through the FAT, two sectors per call, queueing free
    /// clusters.
    fn refill_free_clusters(&mut self) -> Result<(), FsError> {
        if self.scan_from >= self.total_clusters {
            return Err(FsError::DiskFull);
        }

        let mut sector = [0u8; SECTOR_SIZE];
        let mut loaded: Option<u64> = None;
        let mut sectors_read = 0u32;

        while self.scan_from < self.total_clusters {
            let lba = self.fat_sector(self.scan_from);
            if loaded != Some(lba) {
                if sectors_read == FREE_CLUSTERS_SCANNED_SECTORS {
                    break;
                }
                self.dev.read_block(lba, &mut sector)?;
                loaded = Some(lba);
                sectors_read += 1;
            }
            let off = self.fat_offset(self.scan_from);
            let entry = u32::from_le_bytes(sector[off..off + 4].try_into().unwrap());
            if entry & CLUSTER_MASK == CLUSTER_FREE {
                self.free_clusters.push_back(self.scan_from);
            }
            self.scan_from += 1;
        }
        Ok(())
    }

    fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        if self.free_clusters.is_empty() {
            self.refill_free_clusters()?;
        }
        self.free_clusters.pop_front().ok_or(FsError::DiskFull)
    }

    /// Resolve `(first cluster, byte offset)` to `(sector, sector offset)`
    /// by walking the chain.
    fn sector_from_cluster_offset(
        &mut self,
        cluster: u32,
        offset: u32,
    ) -> Result<(u64, usize), FsError> {
        let bytes_per_cluster = self.bytes_per_sec * self.sec_per_clus;
        let mut cluster = cluster;
        let mut offset = offset;
        loop {
            if cluster == CLUSTER_FREE || is_eoc(cluster) {
                return Err(FsError::IndexBounds);
            }
            if cluster == CLUSTER_BAD {
                return Err(FsError::BadCluster);
            }
            if offset >= bytes_per_cluster {
                offset -= bytes_per_cluster;
                cluster = self.get_next_cluster(cluster)?;
                continue;
            }
            let sector =
                self.first_sector_of_cluster(cluster) + u64::from(offset / self.bytes_per_sec);
            return Ok((sector, (offset % self.bytes_per_sec) as usize));
        }
    }

    // ------------------------------------------------------------------
    // Directory entries
    // ------------------------------------------------------------------

    fn parse_dir_entry(
        &self,
        raw: &[u8],
        parent_cluster: u32,
        sector: u64,
        offset: usize,
    ) -> DirEntry {
        let name = shortname_to_name(&raw[..DIR_NAME_LEN]);
        let attr = raw[DIR_ATTR];
        let high = u16::from_le_bytes([raw[DIR_FST_CLUSTER_HIGH], raw[DIR_FST_CLUSTER_HIGH + 1]]);
        let low = u16::from_le_bytes([raw[DIR_FST_CLUSTER_LOW], raw[DIR_FST_CLUSTER_LOW + 1]]);
        let size = u32::from_le_bytes(
            raw[DIR_FILE_SIZE..DIR_FILE_SIZE + 4].try_into().unwrap(),
        );
        DirEntry {
            name,
            attr,
            first_cluster: (u32::from(high) << 16) | u32::from(low),
            size,
            is_dir: attr == ATTR_DIRECTORY,
            sector,
            sector_offset: offset,
            parent_cluster,
        }
    }

    fn marshall_dir_entry(entry: &DirEntry, out: &mut [u8]) {
        out[..DIR_ENTRY_SIZE].fill(0);
        name_to_shortname(&entry.name, &mut out[..DIR_NAME_LEN]);
        out[DIR_ATTR] = entry.attr;
        let high = (entry.first_cluster >> 16) as u16;
        let low = (entry.first_cluster & 0xFFFF) as u16;
        out[DIR_FST_CLUSTER_HIGH..DIR_FST_CLUSTER_HIGH + 2].copy_from_slice(&high.to_le_bytes());
        out[DIR_FST_CLUSTER_LOW..DIR_FST_CLUSTER_LOW + 2].copy_from_slice(&low.to_le_bytes());
        out[DIR_FILE_SIZE..DIR_FILE_SIZE + 4].copy_from_slice(&entry.size.to_le_bytes());
    }

    /// Write an entry's 32 bytes back to its recorded disk location.
    fn write_dirent_back(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.dev.read_block(entry.sector, &mut sector)?;
        Self::marshall_dir_entry(entry, &mut sector[entry.sector_offset..]);
        self.dev.write_block(entry.sector, &sector)
    }

    /// Scan a directory chain for `name`, or for the first free entry slot
    /// when `name` is `None`. Returns the match, its location, and the
    /// cluster the scan ended in (for chain extension).
    fn find_in_directory(
        &mut self,
        dir: &DirEntry,
        name: Option<&str>,
    ) -> Result<(Option<DirEntry>, u64, usize, u32), FsError> {
        let mut cluster = dir.first_cluster;
        if cluster & CLUSTER_MASK == CLUSTER_FREE {
            return Err(FsError::NotFound);
        }

        while !is_eoc(cluster) {
            if cluster == CLUSTER_BAD {
                return Err(FsError::BadCluster);
            }

            // Scan this cluster of the chain. The cluster pointer is
            // authoritative, not the dirent's first cluster.
            let start_sector = self.first_sector_of_cluster(cluster);
            for sector_idx in 0..self.sec_per_clus {
                let lba = start_sector + u64::from(sector_idx);
                let mut data = [0u8; SECTOR_SIZE];
                self.dev.read_block(lba, &mut data)?;

                for off in (0..SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
                    let first_byte = data[off];
                    match name {
                        None => {
                            if first_byte == DIR_ALL_FREE || first_byte == DIR_FREE {
                                return Ok((None, lba, off, cluster));
                            }
                        }
                        Some(wanted) => {
                            if first_byte == DIR_ALL_FREE {
                                return Err(FsError::NotFound);
                            }
                            if first_byte == DIR_FREE {
                                continue;
                            }
                            let entry = self.parse_dir_entry(
                                &data[off..off + DIR_ENTRY_SIZE],
                                dir.first_cluster,
                                lba,
                                off,
                            );
                            if entry.name == wanted {
                                return Ok((Some(entry), lba, off, cluster));
                            }
                        }
                    }
                }
            }
            cluster = self.get_next_cluster(cluster)?;
        }

        Err(FsError::NotFound)
    }

    /// Append one cluster to an entry's chain.
    ///
    /// `last_cluster == 0` means the chain was empty: the fresh cluster
    /// becomes the first, and (when `update_dirent` is set) the on-disk
    /// entry is rewritten to record it.
    fn extend_chain(
        &mut self,
        dir: &mut DirEntry,
        last_cluster: u32,
        update_dirent: bool,
    ) -> Result<u32, FsError> {
        let fresh = self.allocate_cluster()?;
        if dir.first_cluster == CLUSTER_FREE {
            dir.first_cluster = fresh;
        }
        if last_cluster != 0 {
            self.write_fat(last_cluster, fresh)?;
        } else if update_dirent {
            self.write_dirent_back(dir)?;
        }
        self.write_fat(fresh, CLUSTER_EOC)?;
        Ok(fresh)
    }

    /// Give a fresh directory its first cluster with `.` and `..`.
    fn create_new_directory(&mut self, dir: &mut DirEntry) -> Result<(), FsError> {
        let cluster = self.extend_chain(dir, 0, false)?;
        let sector = self.first_sector_of_cluster(cluster);

        let mut data = [0u8; SECTOR_SIZE];
        let dot = DirEntry {
            name: ".".into(),
            attr: ATTR_DIRECTORY,
            first_cluster: dir.first_cluster,
            size: 0,
            is_dir: true,
            sector,
            sector_offset: 0,
            parent_cluster: dir.parent_cluster,
        };
        // `..` of a directory directly under the root records cluster 0.
        let dotdot_cluster = if dir.parent_cluster == self.root_clus {
            0
        } else {
            dir.parent_cluster
        };
        let dotdot = DirEntry {
            name: "..".into(),
            attr: ATTR_DIRECTORY,
            first_cluster: dotdot_cluster,
            size: 0,
            is_dir: true,
            sector,
            sector_offset: DIR_ENTRY_SIZE,
            parent_cluster: dir.parent_cluster,
        };
        Self::marshall_dir_entry(&dot, &mut data);
        Self::marshall_dir_entry(&dotdot, &mut data[DIR_ENTRY_SIZE..]);
        self.dev.write_block(sector, &data)
    }

    /// Create a new entry inside `parent`.
    fn create_dirent_in_dir(
        &mut self,
        parent: &DirEntry,
        name: &str,
        attr: u8,
    ) -> Result<DirEntry, FsError> {
        if !valid_shortname(name) {
            return Err(FsError::IllegalName);
        }

        let mut entry = DirEntry {
            name: name.into(),
            attr,
            first_cluster: 0,
            size: 0,
            is_dir: attr == ATTR_DIRECTORY,
            sector: 0,
            sector_offset: 0,
            parent_cluster: parent.first_cluster,
        };

        if attr == ATTR_DIRECTORY {
            self.create_new_directory(&mut entry)?;
        }

        // First free slot in the parent, extending its chain if needed.
        let (sector, offset) = match self.find_in_directory(parent, None) {
            Ok((_, sector, offset, _)) => (sector, offset),
            Err(FsError::NotFound) => {
                let mut parent_scratch = parent.clone();
                let last = self.get_last_cluster(parent.first_cluster)?;
                let fresh = self.extend_chain(&mut parent_scratch, last, false)?;
                (self.first_sector_of_cluster(fresh), 0)
            }
            Err(e) => return Err(e),
        };

        entry.sector = sector;
        entry.sector_offset = offset;
        self.write_dirent_back(&entry)?;
        Ok(entry)
    }

    /// Resolve a relative path from `current`, optionally creating the
    /// final component.
    fn search_dirent(
        &mut self,
        mut current: DirEntry,
        path: &str,
        create_if_missing: bool,
        attr: u8,
    ) -> Result<DirEntry, FsError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            if !current.is_dir {
                return Err(FsError::NotDir);
            }
            let is_last = components.peek().is_none();
            current = match self.find_in_directory(&current, Some(component)) {
                Ok((Some(entry), _, _, _)) => entry,
                Ok((None, _, _, _)) => return Err(FsError::NotFound),
                Err(FsError::NotFound) if is_last && create_if_missing => {
                    self.create_dirent_in_dir(&current, component, attr)?
                }
                Err(e) => return Err(e),
            };
        }
        Ok(current)
    }

    /// Resolve an absolute path under the mount point.
    fn find_dirent(
        &mut self,
        path: &str,
        create_if_missing: bool,
        attr: u8,
    ) -> Result<DirEntry, FsError> {
        let clean = path.to_uppercase();
        let rest = clean.strip_prefix(&self.mount).ok_or(FsError::NotFound)?;
        let root = self.root_dirent();
        self.search_dirent(root, rest, create_if_missing, attr)
    }

    fn open_dirent(
        &mut self,
        path: &str,
        attr: u8,
        create: bool,
        wrong_type: FsError,
    ) -> Result<Fat32Handle, FsError> {
        let entry = self.find_dirent(path, create, attr)?;
        if entry.attr & attr == 0 {
            return Err(wrong_type);
        }
        Ok(Fat32Handle {
            dirent: entry,
            path: path.to_uppercase(),
            pos: 0,
            is_dir: attr == ATTR_DIRECTORY,
        })
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Open an existing file.
    pub fn open(&mut self, path: &str) -> Result<Fat32Handle, FsError> {
        self.open_dirent(path, ATTR_ARCHIVE, false, FsError::NotFile)
    }

    /// Open a file, creating it if missing.
    pub fn create(&mut self, path: &str) -> Result<Fat32Handle, FsError> {
        self.open_dirent(path, ATTR_ARCHIVE, true, FsError::NotFile)
    }

    /// Open a directory for enumeration.
    pub fn opendir(&mut self, path: &str) -> Result<Fat32Handle, FsError> {
        self.open_dirent(path, ATTR_DIRECTORY, false, FsError::NotDir)
    }

    /// Create a directory (and `.`/`..` inside it).
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.find_dirent(path, true, ATTR_DIRECTORY)?;
        Ok(())
    }

    /// Next entry of an open directory.
    pub fn dir_read_next(
        &mut self,
        handle: &mut Fat32Handle,
    ) -> Result<(String, FileInfo), FsError> {
        if !handle.is_dir {
            return Err(FsError::NotDir);
        }
        loop {
            let (sector, offset) = self.sector_from_cluster_offset(
                handle.dirent.first_cluster,
                handle.pos * DIR_ENTRY_SIZE as u32,
            )?;
            let mut data = [0u8; SECTOR_SIZE];
            self.dev.read_block(sector, &mut data)?;

            match data[offset] {
                DIR_ALL_FREE => return Err(FsError::IndexBounds),
                DIR_FREE => {
                    handle.pos += 1;
                    continue;
                }
                _ => {
                    let entry = self.parse_dir_entry(
                        &data[offset..offset + DIR_ENTRY_SIZE],
                        handle.dirent.first_cluster,
                        sector,
                        offset,
                    );
                    handle.pos += 1;
                    let info = FileInfo {
                        ftype: if entry.is_dir {
                            FileType::Directory
                        } else {
                            FileType::File
                        },
                        size: entry.size,
                    };
                    return Ok((entry.name, info));
                }
            }
        }
    }

    /// Read up to `buf.len()` bytes at the handle position.
    pub fn read(&mut self, handle: &mut Fat32Handle, buf: &mut [u8]) -> Result<usize, FsError> {
        if handle.is_dir {
            return Err(FsError::NotFile);
        }
        let mut data = [0u8; SECTOR_SIZE];
        let mut done = 0usize;

        while done < buf.len() && handle.pos != handle.dirent.size {
            let (sector, offset) =
                self.sector_from_cluster_offset(handle.dirent.first_cluster, handle.pos)?;
            self.dev.read_block(sector, &mut data)?;

            let n = (buf.len() - done)
                .min(SECTOR_SIZE - offset)
                .min((handle.dirent.size - handle.pos) as usize);
            buf[done..done + n].copy_from_slice(&data[offset..offset + n]);
            done += n;
            handle.pos += n as u32;
        }

        if done == 0 && !buf.is_empty() {
            return Err(FsError::Eof);
        }
        Ok(done)
    }

    /// Write at the handle position, extending the chain past the end and
    /// recording the new size in the directory entry.
    pub fn write(&mut self, handle: &mut Fat32Handle, buf: &[u8]) -> Result<usize, FsError> {
        if handle.is_dir {
            return Err(FsError::NotFile);
        }
        let mut data = [0u8; SECTOR_SIZE];
        let mut done = 0usize;

        while done < buf.len() {
            let (sector, offset) =
                match self.sector_from_cluster_offset(handle.dirent.first_cluster, handle.pos) {
                    Ok(pair) => pair,
                    Err(FsError::IndexBounds) => {
                        // Past the end of the chain: append a cluster.
                        let last = self.get_last_cluster(handle.dirent.first_cluster)?;
                        let fresh = self.extend_chain(&mut handle.dirent, last, true)?;
                        (self.first_sector_of_cluster(fresh), 0)
                    }
                    Err(e) => return Err(e),
                };

            let n = (buf.len() - done).min(SECTOR_SIZE - offset);
            if n != SECTOR_SIZE {
                self.dev.read_block(sector, &mut data)?;
            }
            data[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            self.dev.write_block(sector, &data)?;
            done += n;
            handle.pos += n as u32;
        }

        if done > 0 {
            handle.dirent.size = handle.dirent.size.max(handle.pos);
            self.write_dirent_back(&handle.dirent)?;
        }
        Ok(done)
    }

    /// Reposition a file handle.
    pub fn seek(
        &mut self,
        handle: &mut Fat32Handle,
        whence: SeekFrom,
        offset: i64,
    ) -> Result<(), FsError> {
        if handle.is_dir {
            return Err(FsError::NotFile);
        }
        let size = i64::from(handle.dirent.size);
        let target = match whence {
            SeekFrom::Set => offset,
            SeekFrom::Cur => i64::from(handle.pos) + offset,
            SeekFrom::End => size - offset,
        };
        handle.pos = target.clamp(0, size) as u32;
        Ok(())
    }

    /// Current position of a file handle.
    pub fn tell(&self, handle: &Fat32Handle) -> Result<u32, FsError> {
        if handle.is_dir {
            return Err(FsError::NotFile);
        }
        Ok(handle.pos)
    }

    /// Metadata of an open handle.
    pub fn stat(&self, handle: &Fat32Handle) -> FileInfo {
        FileInfo {
            ftype: if handle.is_dir {
                FileType::Directory
            } else {
                FileType::File
            },
            size: handle.dirent.size,
        }
    }

    /// Delete a file.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let entry = self.find_dirent(path, false, ATTR_ARCHIVE)?;
        self.delete_dirent(&entry)
    }

    /// Delete an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let entry = self.find_dirent(path, false, ATTR_DIRECTORY)?;
        self.delete_dirent(&entry)
    }

    fn delete_dirent(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        if entry.parent_cluster == 0 {
            return Err(FsError::RootDelete);
        }
        if entry.is_dir {
            // Entry 0 is `.`, entry 1 is `..`; anything after means the
            // directory is populated.
            if !self.is_last_dirent(entry.first_cluster, 1)? {
                return Err(FsError::NotEmpty);
            }
        }

        self.burn_cluster_chain(entry.first_cluster)?;

        // Whether this was the last entry of its parent decides the marker.
        let parent_sector = self.first_sector_of_cluster(entry.parent_cluster);
        let entries_per_sector = SECTOR_SIZE / DIR_ENTRY_SIZE;
        let index = (entry.sector - parent_sector) as u32 * entries_per_sector as u32
            + (entry.sector_offset / DIR_ENTRY_SIZE) as u32;
        let last_in_parent = self.is_last_dirent(entry.parent_cluster, index)?;

        let mut data = [0u8; SECTOR_SIZE];
        self.dev.read_block(entry.sector, &mut data)?;
        data[entry.sector_offset] = if last_in_parent { DIR_ALL_FREE } else { DIR_FREE };
        self.dev.write_block(entry.sector, &data)
    }

    /// Whether no live entry follows entry `index` in the directory chain
    /// starting at `cluster`.
    fn is_last_dirent(&mut self, cluster: u32, index: u32) -> Result<bool, FsError> {
        let mut index = index + 1;
        loop {
            let (sector, mut offset) =
                match self.sector_from_cluster_offset(cluster, index * DIR_ENTRY_SIZE as u32) {
                    Ok(pair) => pair,
                    Err(FsError::IndexBounds) => return Ok(true),
                    Err(e) => return Err(e),
                };
            let mut data = [0u8; SECTOR_SIZE];
            self.dev.read_block(sector, &mut data)?;
            while offset < SECTOR_SIZE {
                if data[offset] == DIR_ALL_FREE {
                    return Ok(true);
                }
                if data[offset] != DIR_FREE {
                    return Ok(false);
                }
                offset += DIR_ENTRY_SIZE;
                index += 1;
            }
        }
    }

    /// Free an entire cluster chain back to the allocator.
    fn burn_cluster_chain(&mut self, first: u32) -> Result<(), FsError> {
        let mut cluster = first;
        while cluster != CLUSTER_FREE && !is_eoc(cluster) {
            let next = self.get_next_cluster(cluster)?;
            self.write_fat(cluster, 0)?;
            self.free_clusters.push_back(cluster);
            cluster = next;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// 8.3 short names
// ----------------------------------------------------------------------

fn shortname_to_name(short: &[u8]) -> String {
    let mut name = String::with_capacity(12);
    for &b in short[..8].iter().take_while(|&&b| b != b' ') {
        name.push(b as char);
    }
    if short[8] != b' ' {
        name.push('.');
        for &b in short[8..11].iter().take_while(|&&b| b != b' ') {
            name.push(b as char);
        }
    }
    name
}

fn name_to_shortname(name: &str, out: &mut [u8]) {
    out[..DIR_NAME_LEN].fill(b' ');
    if name.starts_with('.') {
        out[0] = b'.';
        if name.len() > 1 && name.as_bytes()[1] == b'.' {
            out[1] = b'.';
        }
        return;
    }
    let (stem, ext) = match name.split_once('.') {
        Some((s, e)) => (s, e),
        None => (name, ""),
    };
    for (i, b) in stem.bytes().take(8).enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
}

fn valid_shortname(name: &str) -> bool {
    let len = name.len();
    if len == 0 || len > 12 {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes[0] == b'.' || bytes[0].is_ascii_digit() {
        return false;
    }
    match name.split_once('.') {
        None => len <= 8 && name.bytes().all(|b| b.is_ascii_alphanumeric()),
        Some((stem, ext)) => {
            stem.len() <= 8
                && ext.len() <= 3
                && stem.bytes().all(|b| b.is_ascii_alphanumeric())
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory block device with a freshly formatted FAT32 volume.
    struct RamDisk {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl BlockDevice for RamDisk {
        fn read_block(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), FsError> {
            let sector = self.sectors.get(lba as usize).ok_or(FsError::BlockRead)?;
            buf.copy_from_slice(sector);
            Ok(())
        }

        fn write_block(&mut self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> Result<(), FsError> {
            let sector = self
                .sectors
                .get_mut(lba as usize)
                .ok_or(FsError::BlockWrite)?;
            sector.copy_from_slice(buf);
            Ok(())
        }
    }

    const RSVD: u32 = 2;
    const FAT_SZ: u32 = 4;
    const TOTAL_SECTORS: u32 = 134;

    fn mkfs() -> RamDisk {
        let mut disk = RamDisk {
            sectors: vec![[0u8; SECTOR_SIZE]; TOTAL_SECTORS as usize],
        };

        // Boot parameter block
        let bpb = &mut disk.sectors[0];
        bpb[0] = 0xEB;
        bpb[2] = 0x90;
        bpb[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        bpb[13] = 1; // sectors per cluster
        bpb[14..16].copy_from_slice(&(RSVD as u16).to_le_bytes());
        bpb[16] = 1; // one FAT
        bpb[32..36].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        bpb[36..40].copy_from_slice(&FAT_SZ.to_le_bytes());
        bpb[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        bpb[510] = 0x55;
        bpb[511] = 0xAA;

        // FAT: reserved entries + EOC for the root directory cluster.
        let fat = &mut disk.sectors[RSVD as usize];
        fat[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        fat[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        fat[8..12].copy_from_slice(&CLUSTER_EOC.to_le_bytes());

        disk
    }

    #[test]
    fn test_mount_parses_bpb() {
        let fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        assert_eq!(fs.first_data_sector, RSVD + FAT_SZ);
        assert_eq!(fs.total_clusters, TOTAL_SECTORS);
        assert!(!fs.free_clusters.is_empty());
    }

    #[test]
    fn test_mount_rejects_bad_bpb() {
        let mut disk = mkfs();
        disk.sectors[0][510] = 0;
        assert!(matches!(
            Fat32::mount(disk, "/sdcard"),
            Err(FsError::InvalidBpb)
        ));
    }

    #[test]
    fn test_write_then_read_back() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();

        let payload: Vec<u8> = (b'A'..=b'Z').cycle().take(79).collect();
        let mut h = fs.create("/sdcard/myfile2.txt").unwrap();
        let written = fs.write(&mut h, &payload).unwrap();
        assert_eq!(written, 79);

        // Reopen and verify size and contents.
        let mut h = fs.open("/sdcard/myfile2.txt").unwrap();
        assert_eq!(fs.stat(&h).size as usize, payload.len());
        assert_eq!(fs.stat(&h).ftype, FileType::File);

        let mut buf = vec![0u8; payload.len()];
        let read = fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(&buf[..], payload);

        // A further read hits EOF.
        assert!(matches!(fs.read(&mut h, &mut buf), Err(FsError::Eof)));
    }

    #[test]
    fn test_write_spanning_sectors_extends_chain() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();

        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        let mut h = fs.create("/sdcard/big.bin").unwrap();
        assert_eq!(fs.write(&mut h, &payload).unwrap(), payload.len());

        let mut h = fs.open("/sdcard/big.bin").unwrap();
        assert_eq!(fs.stat(&h).size as usize, payload.len());
        let mut buf = vec![0u8; payload.len()];
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(buf, payload);

        // Three sectors, one cluster each, chained through the FAT.
        let first = h.dirent.first_cluster;
        let second = fs.get_next_cluster(first).unwrap();
        assert!(!is_eoc(second));
        let third = fs.get_next_cluster(second).unwrap();
        assert!(!is_eoc(third));
        assert!(is_eoc(fs.get_next_cluster(third).unwrap()));
    }

    #[test]
    fn test_seek_and_partial_read() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        let mut h = fs.create("/sdcard/seek.txt").unwrap();
        fs.write(&mut h, b"0123456789").unwrap();

        let mut h = fs.open("/sdcard/seek.txt").unwrap();
        fs.seek(&mut h, SeekFrom::Set, 4).unwrap();
        assert_eq!(fs.tell(&h).unwrap(), 4);

        let mut buf = [0u8; 3];
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(&buf, b"456");

        fs.seek(&mut h, SeekFrom::End, 2).unwrap();
        let mut rest = [0u8; 8];
        assert_eq!(fs.read(&mut h, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"89");
    }

    #[test]
    fn test_mkdir_and_enumerate() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        fs.mkdir("/sdcard/logs").unwrap();

        let mut h = fs.create("/sdcard/logs/boot.txt").unwrap();
        fs.write(&mut h, b"ok").unwrap();

        let mut dir = fs.opendir("/sdcard/logs").unwrap();
        let mut names = Vec::new();
        loop {
            match fs.dir_read_next(&mut dir) {
                Ok((name, _)) => names.push(name),
                Err(FsError::IndexBounds) => break,
                Err(e) => panic!("enumeration failed: {e}"),
            }
        }
        assert_eq!(names, vec![".", "..", "BOOT.TXT"]);
    }

    #[test]
    fn test_remove_frees_and_hides() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        let mut h = fs.create("/sdcard/tmp.txt").unwrap();
        fs.write(&mut h, b"scratch").unwrap();

        let free_before = fs.free_clusters.len();
        fs.remove("/sdcard/tmp.txt").unwrap();
        assert!(fs.free_clusters.len() > free_before);
        assert!(matches!(fs.open("/sdcard/tmp.txt"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_rmdir_refuses_populated_directory() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        fs.mkdir("/sdcard/full").unwrap();
        fs.create("/sdcard/full/a.txt").unwrap();

        assert!(matches!(fs.rmdir("/sdcard/full"), Err(FsError::NotEmpty)));

        fs.remove("/sdcard/full/a.txt").unwrap();
        fs.rmdir("/sdcard/full").unwrap();
        assert!(matches!(fs.opendir("/sdcard/full"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_illegal_names_rejected() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        assert!(matches!(
            fs.create("/sdcard/way_too_long_name.txt"),
            Err(FsError::IllegalName)
        ));
        assert!(matches!(
            fs.create("/sdcard/bad%chr.txt"),
            Err(FsError::IllegalName)
        ));
    }

    #[test]
    fn test_shortname_round_trip() {
        let mut short = [0u8; DIR_NAME_LEN];
        name_to_shortname("boot.txt", &mut short);
        assert_eq!(&short, b"BOOT    TXT");
        assert_eq!(shortname_to_name(&short), "BOOT.TXT");

        name_to_shortname("noext", &mut short);
        assert_eq!(shortname_to_name(&short), "NOEXT");
    }

    #[test]
    fn test_paths_outside_mount_rejected() {
        let mut fs = Fat32::mount(mkfs(), "/sdcard").unwrap();
        assert!(matches!(fs.open("/other/x.txt"), Err(FsError::NotFound)));
    }
}
