//! Message bodies and the kind tag, per spec §6. `MessageKind::None = 0` is
//! reserved as a non-message sentinel (`original_source/net/MessageKind.h`),
//! so real kinds start at 1.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageKind {
    None = 0,
    ClientEnroll = 1,
    StartSampling = 2,
    StopSampling = 3,
    SetSamplingPeriod = 4,
    RawSample = 5,
    CallCountData = 6,
    DyLibInfo = 7,
    LoadDyLib = 8,
    ModifyFunction = 9,
    Shutdown = 10,
}

impl MessageKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => MessageKind::None,
            1 => MessageKind::ClientEnroll,
            2 => MessageKind::StartSampling,
            3 => MessageKind::StopSampling,
            4 => MessageKind::SetSamplingPeriod,
            5 => MessageKind::RawSample,
            6 => MessageKind::CallCountData,
            7 => MessageKind::DyLibInfo,
            8 => MessageKind::LoadDyLib,
            9 => MessageKind::ModifyFunction,
            10 => MessageKind::Shutdown,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuncRecord {
    pub label: String,
    pub start: u64,
    pub size: u64,
    pub patchable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleRecord {
    pub bitcode: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSettings {
    pub opt_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientEnrollBody {
    pub process_triple: String,
    pub host_cpu: String,
    pub vma_delta: u64,
    pub funcs: Vec<FuncRecord>,
    pub module: ModuleRecord,
    pub build_settings: BuildSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetSamplingPeriodBody {
    pub period: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSampleBody {
    pub instr_ptr: u64,
    pub time: u64,
    pub thread_id: u32,
    /// Base-first, top-last — the server compensates (see `profiler.rs`).
    pub call_context: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallCountDataBody {
    pub timestamp: u64,
    pub function_counts: std::collections::HashMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DyLibInfoBody {
    pub name: String,
    pub funcs: Vec<FuncRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadDyLibBody {
    pub name: String,
    pub objfile: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DesiredState {
    Redirected,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifyFunctionBody {
    pub name: String,
    pub desired_state: DesiredState,
    pub other_lib: String,
    pub other_name: String,
    pub addr: u64,
}

/// One fully-decoded application message. Variants without a payload carry
/// no body at all, matching the wire protocol exactly (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientEnroll(ClientEnrollBody),
    StartSampling,
    StopSampling,
    SetSamplingPeriod(SetSamplingPeriodBody),
    RawSample(RawSampleBody),
    CallCountData(CallCountDataBody),
    DyLibInfo(DyLibInfoBody),
    LoadDyLib(LoadDyLibBody),
    ModifyFunction(ModifyFunctionBody),
    Shutdown,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ClientEnroll(_) => MessageKind::ClientEnroll,
            Message::StartSampling => MessageKind::StartSampling,
            Message::StopSampling => MessageKind::StopSampling,
            Message::SetSamplingPeriod(_) => MessageKind::SetSamplingPeriod,
            Message::RawSample(_) => MessageKind::RawSample,
            Message::CallCountData(_) => MessageKind::CallCountData,
            Message::DyLibInfo(_) => MessageKind::DyLibInfo,
            Message::LoadDyLib(_) => MessageKind::LoadDyLib,
            Message::ModifyFunction(_) => MessageKind::ModifyFunction,
            Message::Shutdown => MessageKind::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_round_trips_through_u32() {
        for k in [
            MessageKind::None,
            MessageKind::ClientEnroll,
            MessageKind::RawSample,
            MessageKind::Shutdown,
        ] {
            assert_eq!(MessageKind::from_u32(k as u32), Some(k));
        }
    }

    #[test]
    fn unknown_kind_value_is_none() {
        assert_eq!(MessageKind::from_u32(999), None);
    }
}
