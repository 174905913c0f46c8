// Builders for the per-item response entries

use chrono::NaiveDate;

use crate::core::errors::AnalysisError;
use crate::core::types::{
    AggregateItem, AnalysisResult, CroppedPayload, Detection, ErrorRecord, ItemOutcome,
    ProductRecord,
};
use crate::utils::annotate_expiry;

fn with_derived_fields(result: AnalysisResult, today: NaiveDate) -> ItemOutcome {
    match result {
        AnalysisResult::Product(mut record) => {
            annotate_expiry(&mut record, today);
            ItemOutcome::Product(record)
        }
        other => other.into(),
    }
}

/// Entry for a detection that was analysed successfully
pub fn success_item(
    index: usize,
    detection: Detection,
    payload: &CroppedPayload,
    result: AnalysisResult,
    today: NaiveDate,
) -> AggregateItem {
    AggregateItem {
        index,
        source_detection: Some(detection),
        base64_image: Some(payload.data_url.clone()),
        outcome: with_derived_fields(result, today),
    }
}

/// Entry for a detection whose analysis failed
pub fn failure_item(
    index: usize,
    detection: Detection,
    base64_image: Option<String>,
    error: &AnalysisError,
    saved_filename: Option<String>,
) -> AggregateItem {
    AggregateItem {
        index,
        source_detection: Some(detection.clone()),
        base64_image,
        outcome: ItemOutcome::Error(ErrorRecord {
            detection,
            error: error.to_string(),
            error_kind: error.kind(),
            saved_filename,
        }),
    }
}

/// Single entry describing a whole image, used by the multi-angle endpoint
pub fn whole_image_item(mut record: ProductRecord, today: NaiveDate) -> AggregateItem {
    annotate_expiry(&mut record, today);
    AggregateItem {
        index: 1,
        source_detection: None,
        base64_image: None,
        outcome: ItemOutcome::Product(record),
    }
}
