//! Title metadata from `meta/meta.xml`.

use serde::Deserialize;

pub const META_PATH: &str = "/meta/meta.xml";

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Meta {
    pub product_code: XmlText,
    pub title_id: XmlText,
    pub title_version: XmlText,
    pub longname_en: XmlText,
    pub publisher_en: XmlText,
}

#[derive(Deserialize, Debug, Default)]
pub struct XmlText {
    #[serde(rename = "$text", default)]
    pub value: String,
}

impl XmlText {
    /// The value with line breaks folded into spaces, or `None` if empty.
    pub fn get(&self) -> Option<String> {
        let value = self.value.split_whitespace().collect::<Vec<_>>().join(" ");
        (!value.is_empty()).then_some(value)
    }
}

pub fn parse(data: &[u8]) -> Result<Meta, quick_xml::DeError> {
    let text = String::from_utf8_lossy(data);
    quick_xml::de::from_str(text.trim_start_matches('\u{feff}'))
}
