// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stages 1–2: packet framing and PSI (PAT/PMT) parsing.

pub mod packet;
pub mod psi;

pub use packet::{PacketSplitter, TsPacket, TS_PACKET_SIZE, TS_SYNC_BYTE};
pub use psi::{CodecFamily, ProgramMap, PsiParser, StreamDescriptor, StreamMap};
