//! Requested-versus-reserved waste accounting over a live-block snapshot.

use serde::Serialize;

use crate::trace::BlockMetadata;

/// Padding detail for one live allocation.
#[derive(Debug, Clone, Serialize)]
pub struct BlockPadding {
    pub offset: usize,
    pub requested_size: usize,
    pub actual_size: usize,
    pub alignment: usize,
    pub padding_bytes: usize,
    pub efficiency: f64,
    pub tag: String,
}

/// Aggregate waste across every live allocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PaddingReport {
    pub total_requested: usize,
    pub total_actual: usize,
    pub total_wasted: usize,
    pub efficiency: f64,
    pub blocks: Vec<BlockPadding>,
}

impl PaddingReport {
    pub fn from_blocks(blocks: &[BlockMetadata]) -> Self {
        let mut report = PaddingReport::default();
        for block in blocks {
            let wasted = block.actual_size.saturating_sub(block.size);
            let efficiency = if block.actual_size > 0 {
                block.size as f64 / block.actual_size as f64
            } else {
                0.0
            };
            report.blocks.push(BlockPadding {
                offset: block.offset,
                requested_size: block.size,
                actual_size: block.actual_size,
                alignment: block.alignment,
                padding_bytes: wasted,
                efficiency,
                tag: block.tag.sanitized(),
            });
            report.total_requested += block.size;
            report.total_actual += block.actual_size;
        }
        report.total_wasted = report.total_actual.saturating_sub(report.total_requested);
        report.efficiency = if report.total_actual > 0 {
            report.total_requested as f64 / report.total_actual as f64
        } else {
            0.0
        };
        report
    }
}
