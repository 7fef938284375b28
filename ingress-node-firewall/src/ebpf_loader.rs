use std::{
    convert::TryFrom,
    fs,
    future::Future,
    io,
    path::{Path, PathBuf},
};

use aya::{
    Ebpf, EbpfLoader,
    maps::{MapData, perf::AsyncPerfEventArray},
    pin::PinError,
    programs::{
        Xdp, XdpFlags,
        links::{FdLink, PinnedLink},
    },
};
use clap::ValueEnum;
use log::{debug, info, warn};

use crate::{
    attach::{
        self, AttachmentRecord, AttachmentRegistry, ProgramAttacher, SystemInterfaces,
        link_pin_path,
    },
    compiler::{self, ApplyReport},
    error::{Error, Result},
    events::{EventFeed, PipelineHandle, perf_event_array},
    model::FirewallRules,
    sink::{AuditMode, RetryPolicy, open_sink},
    store::{LpmRuleTable, RuleTable, TableInfo},
};
use ingress_node_firewall_common::{LpmKey, RulesValue};

pub const XDP_PROGRAM: &str = "ingress_node_firewall_process";
pub const MAP_RULES_TABLE: &str = "ingress_node_firewall_table_map";
pub const MAP_EVENTS: &str = "ingress_node_firewall_events_map";
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/xdp_ingress_node_firewall_process";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    #[default]
    Skb,
    Driver,
    Hw,
}

pub fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Compiled filtering program object.
    pub program: PathBuf,
    pub pin_dir: PathBuf,
    pub xdp_mode: XdpMode,
}

impl ControllerOptions {
    pub fn table_pin_path(&self) -> PathBuf {
        self.pin_dir.join(MAP_RULES_TABLE)
    }
}

/// Lifts the locked-memory limit for kernels that still charge maps to it.
pub fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

fn missing(what: &str, name: &str) -> Error {
    Error::kernel(
        format!("{what} {name} not found"),
        io::Error::from(io::ErrorKind::NotFound),
    )
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::kernel(format!("failed to create {}", parent.display()), e))?;
    }
    let map = bpf
        .map_mut(map_name)
        .ok_or_else(|| missing("map", map_name))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(())
        }
        Err(err) => Err(Error::kernel(
            format!("failed to pin map {map_name} at {}", path.display()),
            err,
        )),
    }
}

fn xdp_program<'a>(bpf: &'a mut Ebpf) -> Result<&'a mut Xdp> {
    bpf.program_mut(XDP_PROGRAM)
        .ok_or_else(|| missing("program", XDP_PROGRAM))?
        .try_into()
        .map_err(|e| Error::kernel("xdp program has wrong type", e))
}

/// Attaches the loaded XDP program and pins each link as a bpf_link.
pub struct XdpAttacher<'a> {
    ebpf: &'a mut Ebpf,
    flags: XdpFlags,
}

impl<'a> XdpAttacher<'a> {
    pub fn new(ebpf: &'a mut Ebpf, flags: XdpFlags) -> Self {
        Self { ebpf, flags }
    }
}

impl ProgramAttacher for XdpAttacher<'_> {
    type Link = PinnedLink;

    fn attach(&mut self, iface: &str, if_index: u32, pin_path: &Path) -> Result<PinnedLink> {
        let program = xdp_program(self.ebpf)?;
        let link_id = program
            .attach_to_if_index(if_index, self.flags)
            .map_err(|e| Error::kernel(format!("could not attach XDP program to {iface}"), e))?;
        let link = program
            .take_link(link_id)
            .map_err(|e| Error::kernel("failed to take xdp link", e))?;
        let fd_link = FdLink::try_from(link)
            .map_err(|e| Error::kernel("xdp link cannot be pinned on this kernel", e))?;
        fd_link.pin(pin_path).map_err(|e| {
            Error::kernel(
                format!("failed to pin link to pinDir {}", pin_path.display()),
                e,
            )
        })
    }

    fn release(&mut self, record: AttachmentRecord<PinnedLink>) -> Result<()> {
        let fd_link = record.link.unpin().map_err(|e| {
            Error::kernel(
                format!("failed to unpin link {}", record.pin_path.display()),
                e,
            )
        })?;
        drop(fd_link);
        Ok(())
    }
}

/// Removes link pins left behind by an earlier process. Names without a pin
/// are skipped. Returns how many links were released.
pub fn release_pinned_links(pin_dir: &Path, names: &[String]) -> Result<usize> {
    let mut released = 0;
    for name in names {
        let path = link_pin_path(pin_dir, name);
        if !path.exists() {
            debug!("no pinned link at {}", path.display());
            continue;
        }
        let link = PinnedLink::from_pin(&path)
            .map_err(|e| Error::kernel(format!("failed to open pinned link {}", path.display()), e))?;
        let fd_link = link
            .unpin()
            .map_err(|e| Error::kernel(format!("failed to unpin link {}", path.display()), e))?;
        drop(fd_link);
        info!("Unattaching IngressNode Firewall program from iface {name:?}");
        released += 1;
    }
    Ok(released)
}

/// Owns the loaded program, the rule table and every attachment this process
/// made. All operations fail with [`Error::Released`] after [`cleanup`].
///
/// [`cleanup`]: FirewallController::cleanup
pub struct FirewallController {
    ebpf: Option<Ebpf>,
    table: Option<LpmRuleTable>,
    links: AttachmentRegistry<PinnedLink>,
    events: Option<EventFeed<AsyncPerfEventArray<MapData>>>,
    pin_dir: PathBuf,
    flags: XdpFlags,
}

impl FirewallController {
    /// Loads the program object, pins the rule table under the pin directory
    /// and loads the XDP program into the kernel without attaching it.
    pub fn new(opts: &ControllerOptions) -> Result<Self> {
        bump_memlock_rlimit();
        fs::create_dir_all(&opts.pin_dir).map_err(|e| {
            Error::kernel(
                format!("failed to create pinDir {}", opts.pin_dir.display()),
                e,
            )
        })?;

        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&opts.pin_dir)
            .load_file(&opts.program)
            .map_err(|e| {
                Error::kernel(
                    format!(
                        "loading objects: pinDir:{}, object:{}",
                        opts.pin_dir.display(),
                        opts.program.display()
                    ),
                    e,
                )
            })?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!("failed to initialize eBPF logger: {e}");
        }

        pin_map(&mut ebpf, MAP_RULES_TABLE, &opts.table_pin_path())?;
        xdp_program(&mut ebpf)?
            .load()
            .map_err(|e| Error::kernel("failed to load xdp program", e))?;

        let table_map = ebpf
            .take_map(MAP_RULES_TABLE)
            .ok_or_else(|| missing("map", MAP_RULES_TABLE))?;
        let table = LpmRuleTable::from_map(table_map)?;
        info!("Ingress node firewall map info: {}", table.info()?);

        Ok(Self {
            ebpf: Some(ebpf),
            table: Some(table),
            links: AttachmentRegistry::default(),
            events: None,
            pin_dir: opts.pin_dir.clone(),
            flags: xdp_flags(opts.xdp_mode),
        })
    }

    fn table(&self) -> Result<&LpmRuleTable> {
        self.table.as_ref().ok_or(Error::Released)
    }

    pub fn table_info(&self) -> Result<TableInfo> {
        self.table()?.info()
    }

    pub fn table_entries(&self) -> Result<Vec<(LpmKey, RulesValue)>> {
        self.table()?.entries()
    }

    /// Adds, replaces or deletes the entries for every source range in
    /// `policy`.
    pub fn reconcile_rules(&mut self, policy: &FirewallRules, is_delete: bool) -> Result<ApplyReport> {
        let table = self.table.as_mut().ok_or(Error::Released)?;
        compiler::apply(table, policy, is_delete)
    }

    /// Attaches to every named interface, or with `is_delete` releases every
    /// attachment and all other resources held by the controller. An empty
    /// list changes nothing.
    pub fn attach_interfaces(&mut self, names: &[String], is_delete: bool) -> Result<()> {
        let ebpf = self.ebpf.as_mut().ok_or(Error::Released)?;
        let mut attacher = XdpAttacher::new(ebpf, self.flags);
        attach::apply(
            &mut self.links,
            &mut attacher,
            &SystemInterfaces,
            &self.pin_dir,
            names,
            is_delete,
        )?;
        if is_delete && !names.is_empty() {
            self.cleanup()?;
        }
        Ok(())
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentRecord<PinnedLink>> {
        self.links.iter()
    }

    /// Starts reading the events map. The pipeline stops when `shutdown`
    /// resolves. A failed start can be retried.
    pub async fn start_events<F>(
        &mut self,
        audit: AuditMode,
        retry: RetryPolicy,
        shutdown: F,
    ) -> Result<PipelineHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ebpf = self.ebpf.as_mut().ok_or(Error::Released)?;
        let feed = match self.events.take() {
            Some(feed) => feed,
            None => {
                let map = ebpf
                    .take_map(MAP_EVENTS)
                    .ok_or_else(|| missing("map", MAP_EVENTS))?;
                EventFeed::new(perf_event_array(map)?)
            }
        };
        let feed = self.events.insert(feed);
        feed.start(move || open_sink(audit), SystemInterfaces, shutdown, retry)
            .await
    }

    /// Unpins and releases every attachment, then drops the rule table and
    /// program. Calling it again is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(ebpf) = self.ebpf.as_mut() {
            let mut attacher = XdpAttacher::new(ebpf, self.flags);
            result = self.links.release_all(&mut attacher);
        }
        if let Some(mut feed) = self.events.take() {
            feed.stop();
        }
        self.table = None;
        self.ebpf = None;
        result
    }
}
