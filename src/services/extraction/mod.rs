// Remote vision-model extraction
//
// Every call sends one prompt plus one or more `data:` image URLs and expects a
// strict JSON object back. Fields the model cannot read come back as null.

pub mod api_client;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::errors::ItemResult;
use crate::core::types::{ProductRecord, RemoteFreshness};
use crate::middleware::Credential;

pub use api_client::OpenAiExtractor;

/// Remote extraction seam used by the analysis router
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    /// Brand, price and expiry details of a packaged product
    async fn extract_product(&self, credential: &Credential, data_url: &str) -> ItemResult<ProductRecord>;

    /// Name, count and shelf life of a perishable item
    async fn extract_freshness(&self, credential: &Credential, data_url: &str) -> ItemResult<RemoteFreshness>;

    /// One product photographed from several angles, merged into one record
    async fn extract_product_multi(
        &self,
        credential: &Credential,
        data_urls: &[String],
    ) -> ItemResult<ProductRecord>;
}

const PRODUCT_FIELDS: &str = "\
- Brand name
- Brand details (e.g., logo/tagline)
- Pack size
- Expiry date
- MRP (Maximum Retail Price)
- Product name
- Count/quantity of items - count of the product present in the image
- Category of the product (e.g., personal care, household items, health supplements, etc.)
";

pub fn product_prompt() -> String {
    format!(
        "Analyze the image of a grocery product and extract the following information:\n{}",
        PRODUCT_FIELDS
    )
}

pub fn multi_product_prompt() -> String {
    format!(
        "Following are the images of a single grocery product from different angles.\n\
        Analyze the images of the given grocery product and extract the following information:\n{}",
        PRODUCT_FIELDS
    )
}

pub const FRESHNESS_PROMPT: &str = "\
Analyze the image of a grocery product and extract the following information:
- Name of the product (e.g., apple, banana, bread, etc.)
- Count/quantity of items - count of the identified product present in the image (eg - 1,2 ...)
- Category of the product (e.g., fruit, vegetable, bread)
- Estimated shelf life (in terms of days)

Edge Case
If in case the fruit seems spoiled then the estimated shelf life is 0
";

fn nullable(kind: &str, description: &str) -> Value {
    json!({ "type": [kind, "null"], "description": description })
}

fn strict_object(properties: Vec<(&str, Value)>) -> Value {
    let required: Vec<&str> = properties.iter().map(|(name, _)| *name).collect();
    let properties: serde_json::Map<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// JSON schema for a packaged-product extraction
pub fn product_schema() -> Value {
    strict_object(vec![
        ("brand_name", nullable("string", "Name of the brand")),
        ("brand_details", nullable("string", "Details about the brand, such as logo or tagline")),
        ("pack_size", nullable("string", "Size of the product pack")),
        ("expiry_date", nullable("string", "Expiry date of the product")),
        ("mrp", nullable("string", "Maximum Retail Price of the product")),
        ("product_name", nullable("string", "Name of the product")),
        ("item_count", nullable("integer", "Number of items in the image")),
        ("category", nullable("string", "Category of the product, e.g., personal care, household items")),
    ])
}

/// JSON schema for a perishable shelf-life extraction
pub fn freshness_schema() -> Value {
    strict_object(vec![
        ("product_name", nullable("string", "Name of the product (e.g., apple, banana, bread, etc.)")),
        ("item_count", nullable("integer", "Count/quantity of items present in the image")),
        ("category", nullable("string", "Category of the product (e.g., fruit, vegetable, bread)")),
        ("estimated_shelf_life_days", nullable("integer", "Estimated shelf life in terms of days")),
    ])
}
