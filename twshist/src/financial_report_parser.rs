// twshist/src/financial_report_parser.rs
// Extracts the useful parts of a "ReportSnapshot" fundamental report.

use crate::base::TwsError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::collections::BTreeMap;

/// A ratio value: `Type="N"` ratios are numeric, the rest are kept as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RatioValue {
  Number(f64),
  Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Address {
  pub street: Vec<String>,
  pub city: Option<String>,
  pub state_region: Option<String>,
  pub postal_code: Option<String>,
  pub country: Option<String>,
  pub country_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FundamentalSnapshot {
  pub company_name: Option<String>,
  pub exchange: Option<String>,
  pub price_currency: Option<String>,
  pub address: Address,
  /// Keyed by `FieldName` (e.g. "NPRICE", "PEEXCLXOR").
  pub ratios: BTreeMap<String, RatioValue>,
}

fn get_attr_value(e: &BytesStart, key: &[u8]) -> Result<Option<String>, TwsError> {
  for attr_result in e.attributes() {
    let attr = attr_result.map_err(|err| TwsError::ParseError(format!("XML attribute parsing error: {}", err)))?;
    if attr.key.as_ref() == key {
      let value = attr
        .unescape_value()
        .map_err(|err| TwsError::ParseError(format!("Attribute value unescape error: {}", err)))?;
      return Ok(Some(value.into_owned()));
    }
  }
  Ok(None)
}

// An open element: its name and the attributes we may need at text time.
struct Open {
  name: Vec<u8>,
  kind: Option<String>,
  field: Option<String>,
}

fn under(stack: &[Open], ancestor: &[u8]) -> bool {
  stack.iter().any(|o| o.name == ancestor)
}

/// Parse a ReportSnapshot document.
pub fn parse_snapshot(xml_data: &str) -> Result<FundamentalSnapshot, TwsError> {
  let mut reader = Reader::from_str(xml_data);
  reader.trim_text(true);
  let mut buf = Vec::new();
  let mut snapshot = FundamentalSnapshot::default();
  let mut stack: Vec<Open> = Vec::new();
  let mut seen_root = false;

  loop {
    match reader.read_event_into(&mut buf) {
      Ok(Event::Start(e)) => {
        let name = e.name().as_ref().to_vec();
        match name.as_slice() {
          b"ReportSnapshot" => seen_root = true,
          b"Ratios" => snapshot.price_currency = get_attr_value(&e, b"PriceCurrency")?,
          b"Exchange" if under(&stack, b"Issue") && snapshot.exchange.is_none() => {
            snapshot.exchange = get_attr_value(&e, b"Code")?;
          }
          b"country" if under(&stack, b"contactInfo") => {
            snapshot.address.country_code = get_attr_value(&e, b"code")?;
          }
          _ => {}
        }
        let kind = get_attr_value(&e, b"Type")?;
        let field = get_attr_value(&e, b"FieldName")?;
        stack.push(Open { name, kind, field });
      }
      Ok(Event::Empty(e)) => {
        if e.name().as_ref() == b"ReportSnapshot" {
          seen_root = true;
        }
      }
      Ok(Event::Text(t)) => {
        let text = t.unescape().map_err(|e| TwsError::ParseError(format!("XML text error: {}", e)))?.into_owned();
        let current = match stack.last() {
          Some(open) => open,
          None => continue,
        };
        match current.name.as_slice() {
          b"CoID" if current.kind.as_deref() == Some("CompanyName") => snapshot.company_name = Some(text),
          b"streetAddress" => snapshot.address.street.push(text),
          b"city" => snapshot.address.city = Some(text),
          b"state-region" => snapshot.address.state_region = Some(text),
          b"postalCode" => snapshot.address.postal_code = Some(text),
          b"country" if under(&stack, b"contactInfo") => snapshot.address.country = Some(text),
          // ForecastData also has Ratio elements, but with nested values.
          b"Ratio" if under(&stack, b"Ratios") => {
            if let Some(field) = current.field.clone() {
              let value = match current.kind.as_deref() {
                Some("N") => match text.trim().parse::<f64>() {
                  Ok(n) => RatioValue::Number(n),
                  Err(_) => RatioValue::Text(text),
                },
                _ => RatioValue::Text(text),
              };
              snapshot.ratios.insert(field, value);
            }
          }
          _ => {}
        }
      }
      Ok(Event::End(_)) => {
        stack.pop();
      }
      Ok(Event::Eof) => break,
      Ok(_) => {}
      Err(e) => {
        return Err(TwsError::ParseError(format!(
          "XML error at position {}: {}",
          reader.buffer_position(),
          e
        )))
      }
    }
    buf.clear();
  }

  if !seen_root {
    return Err(TwsError::ParseError("Not a ReportSnapshot document".to_string()));
  }
  Ok(snapshot)
}
