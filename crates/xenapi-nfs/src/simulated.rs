//! In-memory XAPI for tests and dry runs.
//!
//! `SimulatedXapi` implements [`XenApiTransport`] on top of a small object
//! model: one pool, one host, one VM with a root disk, a local SR, and a
//! single NFS export whose SR directories and `.vhd` files are tracked so
//! callers can check what was left on the storage. Every request is recorded
//! and failures use the same `ErrorDescription` codes as a real XAPI.

use crate::error::XenApiResult;
use crate::transport::XenApiTransport;
use crate::types::*;
use crate::xmlrpc::{envelope_failure, envelope_success, Value};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const DEFAULT_USERNAME: &str = "root";
const DEFAULT_PASSWORD: &str = "secret";

/// A failure reported back through the XenAPI envelope.
#[derive(Debug)]
struct Fault {
    code: &'static str,
    params: Vec<String>,
}

impl Fault {
    fn new(code: &'static str, params: &[&str]) -> Self {
        Self {
            code,
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn handle_invalid(class: &str, handle: &str) -> Self {
        Self::new("HANDLE_INVALID", &[class, handle])
    }

    fn uuid_invalid(class: &str, uuid: &str) -> Self {
        Self::new("UUID_INVALID", &[class, uuid])
    }
}

type SimResult = Result<Value, Fault>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Argument access
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Args<'a> {
    method: &'a str,
    params: &'a [Value],
}

impl<'a> Args<'a> {
    fn value(&self, index: usize) -> Result<&'a Value, Fault> {
        self.params.get(index).ok_or_else(|| {
            Fault::new(
                "MESSAGE_PARAMETER_COUNT_MISMATCH",
                &[self.method, &(index + 1).to_string(), &self.params.len().to_string()],
            )
        })
    }

    fn str(&self, index: usize) -> Result<&'a str, Fault> {
        self.value(index)?
            .as_str()
            .ok_or_else(|| Fault::new("FIELD_TYPE_ERROR", &[self.method]))
    }

    fn bool(&self, index: usize) -> Result<bool, Fault> {
        self.value(index)?
            .as_bool()
            .ok_or_else(|| Fault::new("FIELD_TYPE_ERROR", &[self.method]))
    }

    fn int64(&self, index: usize) -> Result<i64, Fault> {
        parse_int64(self.method, self.value(index)?)
    }

    fn record(&self, index: usize) -> Result<&'a BTreeMap<String, Value>, Fault> {
        match self.value(index)? {
            Value::Struct(members) => Ok(members),
            _ => Err(Fault::new("FIELD_TYPE_ERROR", &[self.method])),
        }
    }

    fn string_map(&self, index: usize) -> Result<BTreeMap<String, String>, Fault> {
        to_string_map(self.method, self.record(index)?)
    }
}

fn parse_int64(method: &str, value: &Value) -> Result<i64, Fault> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::String(s) => s
            .parse()
            .map_err(|_| Fault::new("FIELD_TYPE_ERROR", &[method, s])),
        _ => Err(Fault::new("FIELD_TYPE_ERROR", &[method])),
    }
}

fn to_string_map(
    method: &str,
    members: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, String>, Fault> {
    members
        .iter()
        .map(|(k, v)| match v.as_str() {
            Some(s) => Ok((k.clone(), s.to_string())),
            None => Err(Fault::new("FIELD_TYPE_ERROR", &[method, k])),
        })
        .collect()
}

fn field<'a>(
    method: &str,
    record: &'a BTreeMap<String, Value>,
    key: &str,
) -> Result<&'a Value, Fault> {
    record
        .get(key)
        .ok_or_else(|| Fault::new("MISSING_FIELD", &[method, key]))
}

fn field_str<'a>(
    method: &str,
    record: &'a BTreeMap<String, Value>,
    key: &str,
) -> Result<&'a str, Fault> {
    field(method, record, key)?
        .as_str()
        .ok_or_else(|| Fault::new("FIELD_TYPE_ERROR", &[method, key]))
}

fn field_bool(record: &BTreeMap<String, Value>, key: &str) -> bool {
    record.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn refs<'a>(items: impl Iterator<Item = &'a String>) -> Value {
    Value::Array(items.map(Value::from).collect())
}

fn new_ref() -> String {
    format!("OpaqueRef:{}", Uuid::new_v4())
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Object model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SimSr {
    uuid: String,
    name_label: String,
    name_description: String,
    sr_type: String,
    content_type: String,
    shared: bool,
    sm_config: BTreeMap<String, String>,
}

impl SimSr {
    fn on_export(&self) -> bool {
        self.sr_type == NFS_SR_TYPE
    }
}

struct SimPbd {
    uuid: String,
    host: String,
    sr: String,
    device_config: BTreeMap<String, String>,
    attached: bool,
}

struct SimVdi {
    uuid: String,
    name_label: String,
    sr: String,
    virtual_size: i64,
    vdi_type: String,
    sharable: bool,
    read_only: bool,
}

struct SimVbd {
    uuid: String,
    vm: String,
    vdi: String,
    userdevice: String,
    mode: String,
    device: String,
    attached: bool,
}

struct State {
    sessions: BTreeSet<String>,
    pool: String,
    host: String,
    host_uuid: String,
    vm: String,
    vm_uuid: String,
    default_sr: String,
    srs: BTreeMap<String, SimSr>,
    pbds: BTreeMap<String, SimPbd>,
    vdis: BTreeMap<String, SimVdi>,
    vbds: BTreeMap<String, SimVbd>,
    /// SR directory name -> (VDI uuid -> virtual size).
    export: BTreeMap<String, BTreeMap<String, i64>>,
}

impl State {
    fn seeded() -> Self {
        let host = new_ref();
        let vm = new_ref();
        let local_sr = new_ref();
        let root_vdi = new_ref();

        let mut state = Self {
            sessions: BTreeSet::new(),
            pool: new_ref(),
            host: host.clone(),
            host_uuid: new_uuid(),
            vm: vm.clone(),
            vm_uuid: new_uuid(),
            default_sr: local_sr.clone(),
            srs: BTreeMap::new(),
            pbds: BTreeMap::new(),
            vdis: BTreeMap::new(),
            vbds: BTreeMap::new(),
            export: BTreeMap::new(),
        };

        state.srs.insert(
            local_sr.clone(),
            SimSr {
                uuid: new_uuid(),
                name_label: "Local storage".to_string(),
                name_description: String::new(),
                sr_type: "lvm".to_string(),
                content_type: "user".to_string(),
                shared: false,
                sm_config: BTreeMap::new(),
            },
        );
        state.pbds.insert(
            new_ref(),
            SimPbd {
                uuid: new_uuid(),
                host,
                sr: local_sr.clone(),
                device_config: BTreeMap::from([(
                    "device".to_string(),
                    "/dev/sda3".to_string(),
                )]),
                attached: true,
            },
        );
        state.vdis.insert(
            root_vdi.clone(),
            SimVdi {
                uuid: new_uuid(),
                name_label: "root".to_string(),
                sr: local_sr,
                virtual_size: 8 << 30,
                vdi_type: "system".to_string(),
                sharable: false,
                read_only: false,
            },
        );
        state.vbds.insert(
            new_ref(),
            SimVbd {
                uuid: new_uuid(),
                vm,
                vdi: root_vdi,
                userdevice: "0".to_string(),
                mode: "RW".to_string(),
                device: "xvda".to_string(),
                attached: true,
            },
        );
        state
    }

    // ── Lookups ─────────────────────────────────────────────────────

    fn sr(&self, handle: &str) -> Result<&SimSr, Fault> {
        self.srs
            .get(handle)
            .ok_or_else(|| Fault::handle_invalid("SR", handle))
    }

    fn sr_mut(&mut self, handle: &str) -> Result<&mut SimSr, Fault> {
        self.srs
            .get_mut(handle)
            .ok_or_else(|| Fault::handle_invalid("SR", handle))
    }

    fn pbd_mut(&mut self, handle: &str) -> Result<&mut SimPbd, Fault> {
        self.pbds
            .get_mut(handle)
            .ok_or_else(|| Fault::handle_invalid("PBD", handle))
    }

    fn vdi(&self, handle: &str) -> Result<&SimVdi, Fault> {
        self.vdis
            .get(handle)
            .ok_or_else(|| Fault::handle_invalid("VDI", handle))
    }

    fn vbd(&self, handle: &str) -> Result<&SimVbd, Fault> {
        self.vbds
            .get(handle)
            .ok_or_else(|| Fault::handle_invalid("VBD", handle))
    }

    fn vbd_mut(&mut self, handle: &str) -> Result<&mut SimVbd, Fault> {
        self.vbds
            .get_mut(handle)
            .ok_or_else(|| Fault::handle_invalid("VBD", handle))
    }

    fn check_host(&self, handle: &str) -> Result<(), Fault> {
        if handle == self.host {
            Ok(())
        } else {
            Err(Fault::handle_invalid("host", handle))
        }
    }

    fn sr_pbds<'a>(&'a self, sr: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.pbds
            .iter()
            .filter(move |(_, p)| p.sr == sr)
            .map(|(r, _)| r)
    }

    fn sr_vdis<'a>(&'a self, sr: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.vdis
            .iter()
            .filter(move |(_, v)| v.sr == sr)
            .map(|(r, _)| r)
    }

    fn vdi_vbds<'a>(&'a self, vdi: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.vbds
            .iter()
            .filter(move |(_, b)| b.vdi == vdi)
            .map(|(r, _)| r)
    }

    fn sr_attached(&self, sr: &str) -> bool {
        self.pbds.values().any(|p| p.sr == sr && p.attached)
    }

    fn require_attached(&self, sr: &str) -> Result<(), Fault> {
        if self.sr_attached(sr) {
            Ok(())
        } else {
            Err(Fault::new("SR_HAS_NO_PBDS", &[sr]))
        }
    }

    fn vdi_in_use(&self, vdi: &str) -> bool {
        self.vbds.values().any(|b| b.vdi == vdi && b.attached)
    }

    /// Drop the records (not the files) of `sr`, its PBDs and its VDIs.
    fn drop_sr_records(&mut self, sr: &str) {
        self.srs.remove(sr);
        self.pbds.retain(|_, p| p.sr != sr);
        let gone: BTreeSet<String> = self.sr_vdis(sr).cloned().collect();
        self.vdis.retain(|r, _| !gone.contains(r));
        self.vbds.retain(|_, b| !gone.contains(&b.vdi));
    }

    fn insert_vdi(&mut self, vdi: SimVdi) -> String {
        let handle = new_ref();
        if let Some(sr) = self.srs.get(&vdi.sr) {
            if sr.on_export() {
                self.export
                    .entry(sr.uuid.clone())
                    .or_default()
                    .insert(vdi.uuid.clone(), vdi.virtual_size);
            }
        }
        self.vdis.insert(handle.clone(), vdi);
        handle
    }

    fn vhd_of(&mut self, vdi: &str) -> Option<&mut i64> {
        let v = self.vdis.get(vdi)?;
        let sr = self.srs.get(&v.sr)?;
        if !sr.on_export() {
            return None;
        }
        self.export.get_mut(&sr.uuid)?.get_mut(&v.uuid)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn login(&mut self, args: &Args, username: &str, password: &str) -> SimResult {
        let user = args.str(0)?;
        let pass = args.str(1)?;
        if user != username || pass != password {
            return Err(Fault::new(
                "SESSION_AUTHENTICATION_FAILED",
                &[user, "Authentication failure"],
            ));
        }
        let handle = new_ref();
        self.sessions.insert(handle.clone());
        Ok(Value::from(handle))
    }

    fn dispatch(&mut self, method: &str, params: &[Value], creds: (&str, &str)) -> SimResult {
        if method == "session.login_with_password" {
            return self.login(&Args { method, params }, creds.0, creds.1);
        }

        let handle = params.first().and_then(Value::as_str).unwrap_or_default();
        if !self.sessions.contains(handle) {
            return Err(Fault::new("SESSION_INVALID", &[handle]));
        }
        let args = Args {
            method,
            params: &params[1..],
        };

        match method {
            "session.logout" => {
                self.sessions.remove(handle);
                Ok(Value::from(""))
            }
            "session.get_pool" => Ok(Value::from(false)),
            "session.get_this_host" => Ok(Value::from(&self.host)),

            "pool.get_all" => Ok(refs(std::iter::once(&self.pool))),
            "pool.get_default_SR" => {
                let pool = args.str(0)?;
                if pool != self.pool {
                    return Err(Fault::handle_invalid("pool", pool));
                }
                Ok(Value::from(&self.default_sr))
            }

            "host.get_all" => Ok(refs(std::iter::once(&self.host))),
            "host.get_record" => {
                self.check_host(args.str(0)?)?;
                Ok(Value::structure([
                    ("uuid", Value::from(&self.host_uuid)),
                    ("name_label", Value::from("sim-host")),
                    ("hostname", Value::from("sim-host")),
                    ("address", Value::from("192.0.2.10")),
                ]))
            }
            "host.get_uuid" => {
                self.check_host(args.str(0)?)?;
                Ok(Value::from(&self.host_uuid))
            }
            "host.get_by_uuid" => {
                let uuid = args.str(0)?;
                if uuid != self.host_uuid {
                    return Err(Fault::uuid_invalid("host", uuid));
                }
                Ok(Value::from(&self.host))
            }
            "host.call_plugin" => self.call_plugin(&args),

            "SR.get_all" => Ok(refs(self.srs.keys())),
            "SR.get_record" => self.sr_record(args.str(0)?),
            "SR.get_by_uuid" => {
                let uuid = args.str(0)?;
                self.srs
                    .iter()
                    .find(|(_, sr)| sr.uuid == uuid)
                    .map(|(r, _)| Value::from(r))
                    .ok_or_else(|| Fault::uuid_invalid("SR", uuid))
            }
            "SR.get_uuid" => Ok(Value::from(&self.sr(args.str(0)?)?.uuid)),
            "SR.get_name_label" => Ok(Value::from(&self.sr(args.str(0)?)?.name_label)),
            "SR.get_name_description" => {
                Ok(Value::from(&self.sr(args.str(0)?)?.name_description))
            }
            "SR.get_PBDs" => {
                let sr = args.str(0)?;
                self.sr(sr)?;
                Ok(refs(self.sr_pbds(sr)))
            }
            "SR.create" => self.sr_create(&args),
            "SR.introduce" => self.sr_introduce(&args),
            "SR.forget" => self.sr_forget(args.str(0)?),
            "SR.destroy" => self.sr_destroy(args.str(0)?),
            "SR.scan" => self.sr_scan(args.str(0)?),

            "PBD.get_all" => Ok(refs(self.pbds.keys())),
            "PBD.get_record" => self.pbd_record(args.str(0)?),
            "PBD.create" => self.pbd_create(&args),
            "PBD.plug" => {
                self.pbd_mut(args.str(0)?)?.attached = true;
                Ok(Value::from(""))
            }
            "PBD.unplug" => self.pbd_unplug(args.str(0)?),
            "PBD.destroy" => {
                let pbd = args.str(0)?;
                if self.pbd_mut(pbd)?.attached {
                    return Err(Fault::new("PBD_IS_PLUGGED", &[pbd]));
                }
                self.pbds.remove(pbd);
                Ok(Value::from(""))
            }

            "VDI.get_all" => Ok(refs(self.vdis.keys())),
            "VDI.get_record" => self.vdi_record(args.str(0)?),
            "VDI.get_by_uuid" => {
                let uuid = args.str(0)?;
                self.vdis
                    .iter()
                    .find(|(_, v)| v.uuid == uuid)
                    .map(|(r, _)| Value::from(r))
                    .ok_or_else(|| Fault::uuid_invalid("VDI", uuid))
            }
            "VDI.get_uuid" => Ok(Value::from(&self.vdi(args.str(0)?)?.uuid)),
            "VDI.get_SR" => Ok(Value::from(&self.vdi(args.str(0)?)?.sr)),
            "VDI.get_virtual_size" => Ok(Value::from(
                self.vdi(args.str(0)?)?.virtual_size.to_string(),
            )),
            "VDI.create" => self.vdi_create(&args),
            "VDI.destroy" => self.vdi_destroy(args.str(0)?),
            "VDI.resize" => self.vdi_resize(args.str(0)?, args.int64(1)?),
            "VDI.copy" => self.vdi_copy(args.str(0)?, args.str(1)?),

            "VM.get_by_uuid" => {
                let uuid = args.str(0)?;
                if uuid != self.vm_uuid {
                    return Err(Fault::uuid_invalid("VM", uuid));
                }
                Ok(Value::from(&self.vm))
            }
            "VM.get_VBDs" => {
                let vm = args.str(0)?;
                if vm != self.vm {
                    return Err(Fault::handle_invalid("VM", vm));
                }
                Ok(refs(
                    self.vbds
                        .iter()
                        .filter(|(_, b)| b.vm == vm)
                        .map(|(r, _)| r),
                ))
            }

            "VBD.get_record" => self.vbd_record(args.str(0)?),
            "VBD.get_device" => Ok(Value::from(&self.vbd(args.str(0)?)?.device)),
            "VBD.get_VDI" => Ok(Value::from(&self.vbd(args.str(0)?)?.vdi)),
            "VBD.create" => self.vbd_create(&args),
            "VBD.plug" => self.vbd_plug(args.str(0)?),
            "VBD.unplug" => {
                let vbd = self.vbd_mut(args.str(0)?)?;
                if !vbd.attached {
                    return Err(Fault::new("DEVICE_ALREADY_DETACHED", &[vbd.uuid.as_str()]));
                }
                vbd.attached = false;
                vbd.device.clear();
                Ok(Value::from(""))
            }
            "VBD.destroy" => {
                let vbd = args.str(0)?;
                if self.vbd(vbd)?.attached {
                    return Err(Fault::new("OPERATION_NOT_ALLOWED", &["VBD is attached"]));
                }
                self.vbds.remove(vbd);
                Ok(Value::from(""))
            }

            _ => Err(Fault::new("MESSAGE_METHOD_UNKNOWN", &[method])),
        }
    }

    // ── host ────────────────────────────────────────────────────────

    fn call_plugin(&self, args: &Args) -> SimResult {
        self.check_host(args.str(0)?)?;
        let plugin = args.str(1)?;
        let function = args.str(2)?;
        let plugin_args = args.string_map(3)?;
        match plugin {
            "echo" => {
                let rendered: Vec<String> = plugin_args
                    .iter()
                    .map(|(k, v)| format!("'{k}': '{v}'"))
                    .collect();
                Ok(Value::from(format!("args were: {{{}}}", rendered.join(", "))))
            }
            _ => Err(Fault::new(
                "XENAPI_MISSING_PLUGIN",
                &[plugin, function],
            )),
        }
    }

    // ── SR ──────────────────────────────────────────────────────────

    fn sr_record(&self, handle: &str) -> SimResult {
        let sr = self.sr(handle)?;
        Ok(Value::structure([
            ("uuid", Value::from(&sr.uuid)),
            ("name_label", Value::from(&sr.name_label)),
            ("name_description", Value::from(&sr.name_description)),
            ("type", Value::from(&sr.sr_type)),
            ("content_type", Value::from(&sr.content_type)),
            ("shared", Value::from(sr.shared)),
            ("PBDs", refs(self.sr_pbds(handle))),
            ("VDIs", refs(self.sr_vdis(handle))),
            ("physical_size", Value::from("0")),
            ("sm_config", Value::from(&sr.sm_config)),
        ]))
    }

    fn sr_create(&mut self, args: &Args) -> SimResult {
        let host = args.str(0)?;
        self.check_host(host)?;
        let device_config = args.string_map(1)?;
        args.int64(2)?;
        let sr_type = args.str(5)?;
        if sr_type == NFS_SR_TYPE {
            for key in ["server", "serverpath"] {
                if device_config.get(key).map_or(true, |v| v.is_empty()) {
                    return Err(Fault::new(
                        "SR_BACKEND_FAILURE_101",
                        &["", &format!("The request is missing the {key} parameter")],
                    ));
                }
            }
        }

        let sr = SimSr {
            uuid: new_uuid(),
            name_label: args.str(3)?.to_string(),
            name_description: args.str(4)?.to_string(),
            sr_type: sr_type.to_string(),
            content_type: args.str(6)?.to_string(),
            shared: args.bool(7)?,
            sm_config: args.string_map(8)?,
        };
        if sr.on_export() {
            self.export.insert(sr.uuid.clone(), BTreeMap::new());
        }

        let handle = new_ref();
        self.srs.insert(handle.clone(), sr);
        self.pbds.insert(
            new_ref(),
            SimPbd {
                uuid: new_uuid(),
                host: host.to_string(),
                sr: handle.clone(),
                device_config,
                attached: true,
            },
        );
        Ok(Value::from(handle))
    }

    fn sr_introduce(&mut self, args: &Args) -> SimResult {
        let uuid = args.str(0)?;
        if self.srs.values().any(|sr| sr.uuid == uuid) {
            return Err(Fault::new("UUID_ALREADY_EXISTS", &["SR", uuid]));
        }
        let sr = SimSr {
            uuid: uuid.to_string(),
            name_label: args.str(1)?.to_string(),
            name_description: args.str(2)?.to_string(),
            sr_type: args.str(3)?.to_string(),
            content_type: args.str(4)?.to_string(),
            shared: args.bool(5)?,
            sm_config: args.string_map(6)?,
        };
        let handle = new_ref();
        self.srs.insert(handle.clone(), sr);
        Ok(Value::from(handle))
    }

    fn sr_forget(&mut self, handle: &str) -> SimResult {
        self.sr(handle)?;
        if self.sr_attached(handle) {
            return Err(Fault::new("SR_HAS_PBD", &[handle]));
        }
        self.drop_sr_records(handle);
        Ok(Value::from(""))
    }

    fn sr_destroy(&mut self, handle: &str) -> SimResult {
        self.require_attached(handle)?;
        if self.sr_vdis(handle).any(|vdi| self.vdi_in_use(vdi)) {
            return Err(Fault::new("SR_NOT_EMPTY", &[]));
        }
        let sr = self.sr(handle)?;
        if sr.on_export() {
            let uuid = sr.uuid.clone();
            self.export.remove(&uuid);
        }
        self.drop_sr_records(handle);
        Ok(Value::from(""))
    }

    /// Sync VDI records with the `.vhd` files in the SR directory.
    fn sr_scan(&mut self, handle: &str) -> SimResult {
        self.require_attached(handle)?;
        let sr = self.sr(handle)?;
        if !sr.on_export() {
            return Ok(Value::from(""));
        }
        let files = self.export.get(&sr.uuid).cloned().unwrap_or_default();

        let known: BTreeSet<String> = self
            .vdis
            .values()
            .filter(|v| v.sr == handle)
            .map(|v| v.uuid.clone())
            .collect();
        self.vdis
            .retain(|_, v| v.sr != handle || files.contains_key(&v.uuid));
        for (uuid, size) in files.iter().filter(|(u, _)| !known.contains(*u)) {
            self.vdis.insert(
                new_ref(),
                SimVdi {
                    uuid: uuid.clone(),
                    name_label: String::new(),
                    sr: handle.to_string(),
                    virtual_size: *size,
                    vdi_type: "user".to_string(),
                    sharable: false,
                    read_only: false,
                },
            );
        }
        Ok(Value::from(""))
    }

    // ── PBD ─────────────────────────────────────────────────────────

    fn pbd_record(&self, handle: &str) -> SimResult {
        let pbd = self
            .pbds
            .get(handle)
            .ok_or_else(|| Fault::handle_invalid("PBD", handle))?;
        Ok(Value::structure([
            ("uuid", Value::from(&pbd.uuid)),
            ("host", Value::from(&pbd.host)),
            ("SR", Value::from(&pbd.sr)),
            ("device_config", Value::from(&pbd.device_config)),
            ("currently_attached", Value::from(pbd.attached)),
        ]))
    }

    fn pbd_create(&mut self, args: &Args) -> SimResult {
        let method = args.method;
        let record = args.record(0)?;
        let host = field_str(method, record, "host")?;
        let sr = field_str(method, record, "SR")?;
        self.check_host(host)?;
        self.sr(sr)?;
        let device_config = match field(method, record, "device_config")? {
            Value::Struct(members) => to_string_map(method, members)?,
            _ => return Err(Fault::new("FIELD_TYPE_ERROR", &[method, "device_config"])),
        };

        let handle = new_ref();
        self.pbds.insert(
            handle.clone(),
            SimPbd {
                uuid: new_uuid(),
                host: host.to_string(),
                sr: sr.to_string(),
                device_config,
                attached: false,
            },
        );
        Ok(Value::from(handle))
    }

    fn pbd_unplug(&mut self, handle: &str) -> SimResult {
        let sr = self
            .pbds
            .get(handle)
            .ok_or_else(|| Fault::handle_invalid("PBD", handle))?
            .sr
            .clone();
        if self.sr_vdis(&sr).any(|vdi| self.vdi_in_use(vdi)) {
            return Err(Fault::new("VDI_IN_USE", &[&sr]));
        }
        self.pbd_mut(handle)?.attached = false;
        Ok(Value::from(""))
    }

    // ── VDI ─────────────────────────────────────────────────────────

    fn vdi_record(&self, handle: &str) -> SimResult {
        let vdi = self.vdi(handle)?;
        Ok(Value::structure([
            ("uuid", Value::from(&vdi.uuid)),
            ("name_label", Value::from(&vdi.name_label)),
            ("SR", Value::from(&vdi.sr)),
            ("virtual_size", Value::from(vdi.virtual_size.to_string())),
            ("type", Value::from(&vdi.vdi_type)),
            ("sharable", Value::from(vdi.sharable)),
            ("read_only", Value::from(vdi.read_only)),
            ("location", Value::from(&vdi.uuid)),
            ("VBDs", refs(self.vdi_vbds(handle))),
        ]))
    }

    fn vdi_create(&mut self, args: &Args) -> SimResult {
        let method = args.method;
        let record = args.record(0)?;
        let sr = field_str(method, record, "SR")?;
        self.sr(sr)?;
        self.require_attached(sr)?;
        let virtual_size = parse_int64(method, field(method, record, "virtual_size")?)?;
        if virtual_size < 0 {
            return Err(Fault::new("VDI_SIZE_INVALID", &[&virtual_size.to_string()]));
        }

        let handle = self.insert_vdi(SimVdi {
            uuid: new_uuid(),
            name_label: record
                .get("name_label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            sr: sr.to_string(),
            virtual_size,
            vdi_type: field_str(method, record, "type")?.to_string(),
            sharable: field_bool(record, "sharable"),
            read_only: field_bool(record, "read_only"),
        });
        Ok(Value::from(handle))
    }

    fn vdi_destroy(&mut self, handle: &str) -> SimResult {
        let vdi = self.vdi(handle)?;
        if self.vdi_in_use(handle) {
            return Err(Fault::new("VDI_IN_USE", &[handle, "destroy"]));
        }
        let file = self
            .srs
            .get(&vdi.sr)
            .filter(|sr| sr.on_export())
            .map(|sr| (sr.uuid.clone(), vdi.uuid.clone()));
        if let Some((sr_uuid, vdi_uuid)) = file {
            if let Some(dir) = self.export.get_mut(&sr_uuid) {
                dir.remove(&vdi_uuid);
            }
        }
        self.vdis.remove(handle);
        self.vbds.retain(|_, b| b.vdi != handle);
        Ok(Value::from(""))
    }

    fn vdi_resize(&mut self, handle: &str, size: i64) -> SimResult {
        let current = self.vdi(handle)?.virtual_size;
        if size < current {
            return Err(Fault::new(
                "VDI_SIZE_INVALID",
                &[&size.to_string(), "shrinking is not supported"],
            ));
        }
        if let Some(vhd) = self.vhd_of(handle) {
            *vhd = size;
        }
        if let Some(vdi) = self.vdis.get_mut(handle) {
            vdi.virtual_size = size;
        }
        Ok(Value::from(""))
    }

    fn vdi_copy(&mut self, handle: &str, sr: &str) -> SimResult {
        self.sr(sr)?;
        self.require_attached(sr)?;
        let source = self.vdi(handle)?;
        self.require_attached(&source.sr)?;
        let copy = SimVdi {
            uuid: new_uuid(),
            name_label: source.name_label.clone(),
            sr: sr.to_string(),
            virtual_size: source.virtual_size,
            vdi_type: source.vdi_type.clone(),
            sharable: source.sharable,
            read_only: false,
        };
        Ok(Value::from(self.insert_vdi(copy)))
    }

    // ── VBD ─────────────────────────────────────────────────────────

    fn vbd_record(&self, handle: &str) -> SimResult {
        let vbd = self.vbd(handle)?;
        Ok(Value::structure([
            ("uuid", Value::from(&vbd.uuid)),
            ("VM", Value::from(&vbd.vm)),
            ("VDI", Value::from(&vbd.vdi)),
            ("device", Value::from(&vbd.device)),
            ("userdevice", Value::from(&vbd.userdevice)),
            ("mode", Value::from(&vbd.mode)),
            ("currently_attached", Value::from(vbd.attached)),
        ]))
    }

    fn vbd_create(&mut self, args: &Args) -> SimResult {
        let method = args.method;
        let record = args.record(0)?;
        let vm = field_str(method, record, "VM")?;
        let vdi = field_str(method, record, "VDI")?;
        if vm != self.vm {
            return Err(Fault::handle_invalid("VM", vm));
        }
        self.vdi(vdi)?;

        let handle = new_ref();
        self.vbds.insert(
            handle.clone(),
            SimVbd {
                uuid: new_uuid(),
                vm: vm.to_string(),
                vdi: vdi.to_string(),
                userdevice: field_str(method, record, "userdevice")?.to_string(),
                mode: field_str(method, record, "mode")?.to_string(),
                device: String::new(),
                attached: false,
            },
        );
        Ok(Value::from(handle))
    }

    /// Attach and assign the first free `xvd?` name in the VM.
    fn vbd_plug(&mut self, handle: &str) -> SimResult {
        let vbd = self.vbd(handle)?;
        if vbd.attached {
            return Err(Fault::new("DEVICE_ALREADY_ATTACHED", &[vbd.uuid.as_str()]));
        }
        let sr = self.vdi(&vbd.vdi)?.sr.clone();
        self.require_attached(&sr)?;

        let used: BTreeSet<&str> = self
            .vbds
            .values()
            .filter(|b| b.vm == vbd.vm && b.attached)
            .map(|b| b.device.as_str())
            .collect();
        let device = (b'a'..=b'z')
            .map(|c| format!("xvd{}", c as char))
            .find(|name| !used.contains(name.as_str()))
            .ok_or_else(|| Fault::new("VBD_NOT_UNPLUGGABLE", &["no free device slot"]))?;

        let vbd = self.vbd_mut(handle)?;
        vbd.device = device;
        vbd.attached = true;
        Ok(Value::from(""))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-method call statistics: how often it was called and the parameters
/// of the latest call. Bounded by the number of distinct methods.
#[derive(Default)]
struct CallLog {
    count: usize,
    last: Vec<Value>,
}

/// Simulated XAPI endpoint.
pub struct SimulatedXapi {
    username: String,
    password: String,
    host_uuid: String,
    vm_uuid: String,
    local_sr: SrRef,
    state: Mutex<State>,
    calls: Mutex<BTreeMap<String, CallLog>>,
    /// Method -> error code returned by its next call.
    failures: Mutex<BTreeMap<String, String>>,
}

impl SimulatedXapi {
    /// A fresh endpoint accepting `root` / `secret`.
    pub fn new() -> Arc<Self> {
        Self::with_credentials(DEFAULT_USERNAME, DEFAULT_PASSWORD)
    }

    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Arc<Self> {
        let state = State::seeded();
        Arc::new(Self {
            username: username.into(),
            password: password.into(),
            host_uuid: state.host_uuid.clone(),
            vm_uuid: state.vm_uuid.clone(),
            local_sr: SrRef::new(state.default_sr.clone()),
            state: Mutex::new(state),
            calls: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn calls(&self) -> MutexGuard<'_, BTreeMap<String, CallLog>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// UUID of the only host.
    pub fn host_uuid(&self) -> String {
        self.host_uuid.clone()
    }

    /// UUID of the VM that owns the root disk.
    pub fn vm_uuid(&self) -> String {
        self.vm_uuid.clone()
    }

    /// The pool's default SR, a local non-NFS repository.
    pub fn local_sr(&self) -> SrRef {
        self.local_sr.clone()
    }

    /// Directory names present on the NFS export.
    pub fn export_entries(&self) -> BTreeSet<String> {
        self.state().export.keys().cloned().collect()
    }

    /// `.vhd` files in one SR directory on the export.
    pub fn vhd_files(&self, sr_uuid: &str) -> BTreeSet<String> {
        self.state()
            .export
            .get(sr_uuid)
            .map(|dir| dir.keys().map(|uuid| format!("{uuid}.vhd")).collect())
            .unwrap_or_default()
    }

    /// Virtual size stored for a VDI file on the export.
    pub fn vhd_size(&self, sr_uuid: &str, vdi_uuid: &str) -> Option<i64> {
        self.state().export.get(sr_uuid)?.get(vdi_uuid).copied()
    }

    /// Parameters of the most recent call to `method`, session handle first.
    pub fn last_call(&self, method: &str) -> Option<Vec<Value>> {
        self.calls().get(method).map(|log| log.last.clone())
    }

    /// Number of calls made to `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.calls().get(method).map_or(0, |log| log.count)
    }

    /// Make the next call to `method` fail with `code` without touching
    /// any state.
    pub fn fail_next(&self, method: impl Into<String>, code: impl Into<String>) {
        self.failures().insert(method.into(), code.into());
    }

    /// Number of sessions currently logged in.
    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }
}

#[async_trait]
impl XenApiTransport for SimulatedXapi {
    async fn request(&self, method: &str, params: Vec<Value>) -> XenApiResult<Value> {
        {
            let mut calls = self.calls();
            let log = calls.entry(method.to_string()).or_default();
            log.count += 1;
            log.last = params.clone();
        }
        if let Some(code) = self.failures().remove(method) {
            log::debug!("[SIM] {method} failed on request: {code}");
            return Ok(envelope_failure(&code, &[method]));
        }
        let outcome = self
            .state()
            .dispatch(method, &params, (self.username.as_str(), self.password.as_str()));
        Ok(match outcome {
            Ok(value) => envelope_success(value),
            Err(fault) => {
                log::debug!("[SIM] {method} failed: {} {:?}", fault.code, fault.params);
                envelope_failure(fault.code, fault.params.as_slice())
            }
        })
    }

    fn endpoint(&self) -> &str {
        "simulated://xapi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmlrpc::unwrap_envelope;

    async fn login(xapi: &SimulatedXapi) -> Value {
        let raw = xapi
            .request(
                "session.login_with_password",
                vec!["root".into(), "secret".into(), "1.0".into(), "test".into()],
            )
            .await
            .unwrap();
        unwrap_envelope("login", raw).unwrap()
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let xapi = SimulatedXapi::new();
        let session = login(&xapi).await;
        let raw = xapi.request("VDI.frobnicate", vec![session]).await.unwrap();
        let err = unwrap_envelope("VDI.frobnicate", raw).unwrap_err();
        assert_eq!(err.failure_code(), Some("MESSAGE_METHOD_UNKNOWN"));
    }

    #[tokio::test]
    async fn calls_without_a_session_are_rejected() {
        let xapi = SimulatedXapi::new();
        let raw = xapi
            .request("SR.get_all", vec!["OpaqueRef:bogus".into()])
            .await
            .unwrap();
        let err = unwrap_envelope("SR.get_all", raw).unwrap_err();
        assert!(err.is_session_invalid());
        assert_eq!(xapi.call_count("SR.get_all"), 1);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let xapi = SimulatedXapi::new();
        let session = login(&xapi).await;
        xapi.fail_next("SR.get_all", "SR_BACKEND_FAILURE");

        let raw = xapi.request("SR.get_all", vec![session.clone()]).await.unwrap();
        let err = unwrap_envelope("SR.get_all", raw).unwrap_err();
        assert_eq!(err.failure_code(), Some("SR_BACKEND_FAILURE"));

        let raw = xapi.request("SR.get_all", vec![session.clone()]).await.unwrap();
        assert!(unwrap_envelope("SR.get_all", raw).is_ok());
        assert_eq!(xapi.call_count("SR.get_all"), 2);
        assert_eq!(xapi.last_call("SR.get_all"), Some(vec![session]));
    }

    #[tokio::test]
    async fn call_log_is_bounded_by_distinct_methods() {
        let xapi = SimulatedXapi::new();
        let session = login(&xapi).await;
        for _ in 0..500 {
            xapi.request("SR.get_all", vec![session.clone()]).await.unwrap();
        }
        assert_eq!(xapi.call_count("SR.get_all"), 500);
        assert_eq!(xapi.calls().len(), 2);
    }

    #[tokio::test]
    async fn seeded_objects() {
        let xapi = SimulatedXapi::new();
        let session = login(&xapi).await;
        assert_eq!(xapi.open_sessions(), 1);
        assert!(xapi.export_entries().is_empty());

        let raw = xapi
            .request("VM.get_by_uuid", vec![session.clone(), xapi.vm_uuid().into()])
            .await
            .unwrap();
        let vm = unwrap_envelope("VM.get_by_uuid", raw).unwrap();
        let raw = xapi.request("VM.get_VBDs", vec![session, vm]).await.unwrap();
        let vbds = unwrap_envelope("VM.get_VBDs", raw).unwrap();
        assert_eq!(vbds.as_array().map(<[Value]>::len), Some(1));
    }
}
