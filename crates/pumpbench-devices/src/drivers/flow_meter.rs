/*!
 * Gas mass flow meter.
 *
 * Register map: 0x0000 instantaneous flow (u16 / 10, L/min),
 * 0x0001..0x0002 cumulative flow (u32 / 10, L).
 */
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{pair, partial, single, Driver};
use crate::codec::{decode_u16, decode_u32, FLOW_SCALE};
use crate::error::Result;
use crate::link::Link;

const INSTANTANEOUS: u16 = 0x0000;
const CUMULATIVE: u16 = 0x0001;

/// One flow meter sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowReading {
    /// L/min
    pub instantaneous_flow: Option<f64>,
    /// L
    pub cumulative_flow: Option<f64>,
}

/// Flow meter driver
#[derive(Debug, Clone)]
pub struct FlowMeter {
    link: Arc<Link>,
}

impl FlowMeter {
    /// Driver over `link`
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Instantaneous flow in L/min
    pub async fn read_instantaneous_flow(&self) -> Result<f64> {
        let regs = self.link.read_holding_registers(INSTANTANEOUS, 1).await?;
        let raw = decode_u16(single(&regs)?);
        let flow = f64::from(raw) / FLOW_SCALE;
        debug!(raw, flow, "Instantaneous flow");
        Ok(flow)
    }

    /// Cumulative flow in L
    pub async fn read_cumulative_flow(&self) -> Result<f64> {
        let regs = self.link.read_holding_registers(CUMULATIVE, 2).await?;
        let [hi, lo] = pair(&regs)?;
        let raw = decode_u32(hi, lo);
        let cumulative = f64::from(raw) / FLOW_SCALE;
        debug!(raw, cumulative, "Cumulative flow");
        Ok(cumulative)
    }

    /// Both values; fails only if both reads fail
    pub async fn read_all(&self) -> Result<FlowReading> {
        let [instantaneous_flow, cumulative_flow] =
            partial([self.read_instantaneous_flow().await, self.read_cumulative_flow().await])?;
        Ok(FlowReading {
            instantaneous_flow,
            cumulative_flow,
        })
    }
}

impl Driver for FlowMeter {
    fn link(&self) -> &Arc<Link> {
        &self.link
    }
}
