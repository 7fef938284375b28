use std::{
    ffi::{CStr, CString},
    io,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::error::{Error, Result};

/// Resolves interface names and indexes.
pub trait InterfaceResolver {
    fn index_of(&self, name: &str) -> io::Result<u32>;
    fn name_of(&self, index: u32) -> io::Result<String>;
}

/// Host interfaces via `if_nametoindex(3)` / `if_indextoname(3)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemInterfaces;

impl InterfaceResolver for SystemInterfaces {
    fn index_of(&self, name: &str) -> io::Result<u32> {
        let ifname =
            CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ifindex)
    }

    fn name_of(&self, index: u32) -> io::Result<String> {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }
}

/// Binds the filtering program to an interface and pins the binding.
pub trait ProgramAttacher {
    type Link;

    fn attach(&mut self, iface: &str, if_index: u32, pin_path: &Path) -> Result<Self::Link>;

    /// Unpins and releases one attachment.
    fn release(&mut self, record: AttachmentRecord<Self::Link>) -> Result<()>;
}

#[derive(Debug)]
pub struct AttachmentRecord<L> {
    pub iface: String,
    pub if_index: u32,
    pub link: L,
    pub pin_path: PathBuf,
}

/// Attachments made by this process. Not rebuilt from existing pins after a
/// restart.
#[derive(Debug)]
pub struct AttachmentRegistry<L> {
    records: Vec<AttachmentRecord<L>>,
}

impl<L> Default for AttachmentRegistry<L> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<L> AttachmentRegistry<L> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachmentRecord<L>> {
        self.records.iter()
    }

    /// Unpins and releases every tracked attachment. Keeps going after a
    /// failure and reports the first one; an empty registry is a no-op.
    pub fn release_all<A>(&mut self, attacher: &mut A) -> Result<()>
    where
        A: ProgramAttacher<Link = L> + ?Sized,
    {
        self.release_from(0, attacher)
    }

    fn release_from<A>(&mut self, start: usize, attacher: &mut A) -> Result<()>
    where
        A: ProgramAttacher<Link = L> + ?Sized,
    {
        let mut first_err = None;
        for record in self.records.drain(start..).rev() {
            let iface = record.iface.clone();
            info!(
                "Unattaching IngressNode Firewall program from iface {:?} (index {})",
                iface, record.if_index
            );
            if let Err(err) = attacher.release(record) {
                warn!("failed to release attachment on {iface}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Pin location of the link for `iface`.
pub fn link_pin_path(pin_dir: &Path, iface: &str) -> PathBuf {
    pin_dir.join(format!("{iface}_link"))
}

/// Resolves every name up front so a bad name fails the call before anything
/// is attached.
pub fn resolve_all<R>(resolver: &R, names: &[String]) -> Result<Vec<(String, u32)>>
where
    R: InterfaceResolver + ?Sized,
{
    names
        .iter()
        .map(|name| {
            resolver
                .index_of(name)
                .map(|index| (name.clone(), index))
                .map_err(|e| Error::kernel(format!("lookup network iface {name:?}"), e))
        })
        .collect()
}

/// Attaches the program to each named interface and records the pinned link.
/// If one attachment fails, the ones made earlier in the same call are
/// released again so the registry is left as it was.
pub fn attach_interfaces<A, R>(
    registry: &mut AttachmentRegistry<A::Link>,
    attacher: &mut A,
    resolver: &R,
    pin_dir: &Path,
    names: &[String],
) -> Result<()>
where
    A: ProgramAttacher + ?Sized,
    R: InterfaceResolver + ?Sized,
{
    let resolved = resolve_all(resolver, names)?;
    let start = registry.len();
    for (iface, if_index) in resolved {
        let pin_path = link_pin_path(pin_dir, &iface);
        match attacher.attach(&iface, if_index, &pin_path) {
            Ok(link) => {
                info!(
                    "Attached IngressNode Firewall program to iface {:?} (index {})",
                    iface, if_index
                );
                registry.records.push(AttachmentRecord {
                    iface,
                    if_index,
                    link,
                    pin_path,
                });
            }
            Err(err) => {
                warn!("attach on {iface} failed, rolling back attachments made by this call");
                if let Err(rollback) = registry.release_from(start, attacher) {
                    warn!("rollback incomplete: {rollback}");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Attaches to `names`, or with `is_delete` releases every attachment in the
/// registry once all of `names` resolve. An empty list is a no-op either way.
pub fn apply<A, R>(
    registry: &mut AttachmentRegistry<A::Link>,
    attacher: &mut A,
    resolver: &R,
    pin_dir: &Path,
    names: &[String],
    is_delete: bool,
) -> Result<()>
where
    A: ProgramAttacher + ?Sized,
    R: InterfaceResolver + ?Sized,
{
    if names.is_empty() {
        return Ok(());
    }
    if is_delete {
        resolve_all(resolver, names)?;
        return registry.release_all(attacher);
    }
    attach_interfaces(registry, attacher, resolver, pin_dir, names)
}
