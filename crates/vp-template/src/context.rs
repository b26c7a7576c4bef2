// SPDX-License-Identifier: MIT OR Apache-2.0
//! Template context binding.
//!
//! Flattens the verification context into the map the templates consume:
//! machine structure (layout metadata first, historical context as
//! fallback), product positions for iteration, historical lookup fields,
//! and — for Turn 2 — the Turn-1 summary.

use serde_json::{Value, json};

use vp_core::VerificationContext;

/// Build the template context for a turn.
///
/// `turn1_summary` carries the Turn-1-extracted facts and is only consulted
/// by the Turn-2 templates. Absent values are simply omitted; the engine
/// renders missing paths as empty strings.
#[must_use]
pub fn build_context(context: &VerificationContext, turn1_summary: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("verificationId".into(), json!(context.verification_id));
    map.insert(
        "verificationType".into(),
        json!(context.verification_type.as_str()),
    );
    map.insert("vendingMachineId".into(), json!(context.vending_machine_id));

    let structure = context
        .layout_metadata
        .as_ref()
        .and_then(|m| m.machine_structure.clone());
    if let Some(structure) = structure {
        map.insert("rowCount".into(), json!(structure.row_count));
        map.insert("columnCount".into(), json!(structure.column_count));
        map.insert(
            "rowLabelSummary".into(),
            json!(structure.row_labels.join(", ")),
        );
    } else if let Some(historical) = &context.historical_context {
        if let Some(rows) = historical.row_count {
            map.insert("rowCount".into(), json!(rows));
        }
        if let Some(columns) = historical.column_count {
            map.insert("columnCount".into(), json!(columns));
        }
        if let Some(labels) = &historical.row_labels {
            map.insert("rowLabelSummary".into(), json!(labels.join(", ")));
        }
    }

    if let Some(metadata) = &context.layout_metadata {
        let positions: Vec<Value> = metadata
            .product_positions
            .iter()
            .map(|p| json!({"position": p.position, "productName": p.product_name}))
            .collect();
        map.insert("productPositions".into(), Value::Array(positions));
        if let Some(location) = &metadata.location {
            map.insert("location".into(), json!(location));
        }
    }

    if let Some(historical) = &context.historical_context {
        map.insert(
            "previousVerificationId".into(),
            json!(historical.previous_verification_id),
        );
        map.insert(
            "previousVerificationStatus".into(),
            json!(historical.previous_verification_status),
        );
        map.insert(
            "hoursSinceLastVerification".into(),
            json!(format!("{:.1}", historical.hours_since_last_verification)),
        );
    }

    if let Some(summary) = turn1_summary {
        map.insert("turn1Summary".into(), json!(summary));
    }

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vp_core::{
        HistoricalContext, LayoutMetadata, MachineStructure, ProductPosition, VerificationType,
    };

    fn base_context(vtype: VerificationType) -> VerificationContext {
        VerificationContext {
            verification_id: "verif-1".into(),
            verification_at: Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap(),
            verification_type: vtype,
            layout_id: Some(42),
            layout_prefix: Some("row-major".into()),
            vending_machine_id: "vm-17".into(),
            layout_metadata: Some(LayoutMetadata {
                machine_structure: Some(MachineStructure {
                    row_count: 6,
                    column_count: 8,
                    row_labels: vec!["A".into(), "B".into()],
                }),
                product_positions: vec![ProductPosition {
                    position: "A1".into(),
                    product_name: "Cola".into(),
                    product_id: None,
                }],
                location: Some("Lobby".into()),
                ..Default::default()
            }),
            historical_context: None,
        }
    }

    #[test]
    fn binds_layout_structure_and_positions() {
        let ctx = build_context(&base_context(VerificationType::LayoutVsChecking), None);
        assert_eq!(ctx["verificationType"], "LAYOUT_VS_CHECKING");
        assert_eq!(ctx["rowCount"], 6);
        assert_eq!(ctx["rowLabelSummary"], "A, B");
        assert_eq!(ctx["productPositions"][0]["productName"], "Cola");
        assert_eq!(ctx["location"], "Lobby");
        assert!(ctx.get("turn1Summary").is_none());
    }

    #[test]
    fn historical_structure_is_the_fallback() {
        let mut context = base_context(VerificationType::PreviousVsCurrent);
        context.layout_metadata = None;
        context.historical_context = Some(HistoricalContext {
            previous_verification_at: Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap(),
            previous_verification_status: "CORRECT".into(),
            previous_verification_id: "verif-prev".into(),
            hours_since_last_verification: 27.04,
            layout_id: None,
            layout_prefix: None,
            row_count: Some(4),
            column_count: Some(5),
            row_labels: Some(vec!["A".into()]),
        });
        let ctx = build_context(&context, None);
        assert_eq!(ctx["rowCount"], 4);
        assert_eq!(ctx["previousVerificationId"], "verif-prev");
        assert_eq!(ctx["hoursSinceLastVerification"], "27.0");
    }

    #[test]
    fn turn1_summary_bound_when_present() {
        let ctx = build_context(
            &base_context(VerificationType::LayoutVsChecking),
            Some("Machine fully stocked."),
        );
        assert_eq!(ctx["turn1Summary"], "Machine fully stocked.");
    }
}
