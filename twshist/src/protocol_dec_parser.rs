// twshist/src/protocol_dec_parser.rs
// Field-level reader over one NUL-separated message body.

use crate::base::TwsError;

pub struct FieldParser<'a> {
  data: &'a [u8],
  fields: Vec<(usize, usize)>, // (start, end) indices for each field
  current_field: usize,
}

impl<'a> FieldParser<'a> {
  /// Create a new field parser
  pub fn new(data: &'a [u8]) -> Self {
    let mut parser = Self {
      data,
      fields: Vec::new(),
      current_field: 0,
    };
    parser.parse_fields();
    parser
  }

  // A trailing field without its NUL is still a field; TWS always
  // terminates, but recorded payloads are sometimes trimmed.
  fn parse_fields(&mut self) {
    let mut start = 0;
    for (i, &b) in self.data.iter().enumerate() {
      if b == 0 {
        self.fields.push((start, i));
        start = i + 1;
      }
    }
    if start < self.data.len() {
      self.fields.push((start, self.data.len()));
    }
  }

  fn field_str(&self, index: usize) -> Result<&'a str, TwsError> {
    let (start, end) = *self.fields.get(index)
      .ok_or_else(|| TwsError::ParseError("Unexpected end of message".to_string()))?;
    if start >= end {
      return Ok("");
    }
    std::str::from_utf8(&self.data[start..end])
      .map_err(|e| TwsError::ParseError(format!("Failed to parse string: {}", e)))
  }

  /// Read a string field
  pub fn read_string(&mut self) -> Result<String, TwsError> {
    let s = self.field_str(self.current_field)?;
    self.current_field += 1;
    Ok(s.to_string())
  }

  /// Read an integer field. Empty reads as 0.
  pub fn read_int(&mut self) -> Result<i32, TwsError> {
    let s = self.read_string()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse::<i32>()
      .map_err(|e| TwsError::ParseError(format!("Failed to parse integer '{}': {}", s, e)))
  }

  /// Read a 64-bit integer field. Empty reads as 0.
  pub fn read_i64(&mut self) -> Result<i64, TwsError> {
    let s = self.read_string()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse::<i64>()
      .map_err(|e| TwsError::ParseError(format!("Failed to parse long '{}': {}", s, e)))
  }

  /// Read a double field. Empty reads as 0.0.
  pub fn read_double(&mut self) -> Result<f64, TwsError> {
    let s = self.read_string()?;
    if s.is_empty() {
      return Ok(0.0);
    }
    s.parse::<f64>()
      .map_err(|e| TwsError::ParseError(format!("Failed to parse double '{}': {}", s, e)))
  }

  /// Read a decimal field (volume, WAP). The gateway sends these as
  /// plain decimal text; unset values arrive empty and read as 0.0.
  pub fn read_decimal(&mut self) -> Result<f64, TwsError> {
    self.read_double()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_typed_fields_in_order() {
    let mut p = FieldParser::new(b"17\0-1\0\0101.25\0abc\0");
    assert_eq!(p.read_int().unwrap(), 17);
    assert_eq!(p.read_int().unwrap(), -1);
    assert_eq!(p.read_double().unwrap(), 0.0);
    assert_eq!(p.read_double().unwrap(), 101.25);
    assert_eq!(p.read_string().unwrap(), "abc");
    assert!(matches!(p.read_string(), Err(TwsError::ParseError(_))));
  }

  #[test]
  fn unterminated_tail_is_a_field() {
    let mut p = FieldParser::new(b"9\01\0500");
    assert_eq!(p.read_int().unwrap(), 9);
    assert_eq!(p.read_int().unwrap(), 1);
    assert_eq!(p.read_int().unwrap(), 500);
  }

  #[test]
  fn bad_number_is_a_parse_error() {
    let mut p = FieldParser::new(b"x1\0");
    assert!(matches!(p.read_int(), Err(TwsError::ParseError(_))));
  }
}
