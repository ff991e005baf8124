//! Parsed candidate queries and their in-memory evaluation.
use std::fmt;

use record::{FieldValue, Record};

use crate::criteria::VALUE_SEPARATOR;
use crate::error::CandidateError;
use crate::params::SearchParamRegistry;

/// Modifier suffix on a search param (`family:exact`, `active:not`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryModifier {
    Exact,
    Not,
}

impl QueryModifier {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "exact" => Some(QueryModifier::Exact),
            "not" => Some(QueryModifier::Not),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            QueryModifier::Exact => "exact",
            QueryModifier::Not => "not",
        }
    }
}

/// `param=v1,v2`: values are OR-ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCondition {
    pub param: String,
    pub modifier: Option<QueryModifier>,
    /// Decoded values.
    pub values: Vec<String>,
}

impl QueryCondition {
    fn matches(&self, record_values: &[&FieldValue]) -> bool {
        let exact = self.modifier == Some(QueryModifier::Exact);
        let hit = self.values.iter().any(|wanted| {
            record_values
                .iter()
                .any(|value| value_matches(wanted, value, exact))
        });
        if self.modifier == Some(QueryModifier::Not) {
            !hit
        } else {
            hit
        }
    }
}

/// A candidate query such as `Patient?given=Jose,Martin&family=Fernandez`.
///
/// Conditions are AND-ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    resource_type: String,
    conditions: Vec<QueryCondition>,
}

impl CandidateQuery {
    /// Query with no conditions: every record of the type.
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            conditions: Vec::new(),
        }
    }

    pub fn with_condition<I, S>(mut self, param: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.push(QueryCondition {
            param: param.to_string(),
            modifier: None,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Parse an emitted query string. Values are percent-decoded.
    pub fn parse(query: &str) -> Result<Self, CandidateError> {
        let (resource_type, rest) = query
            .split_once('?')
            .ok_or_else(|| CandidateError::malformed(query, "missing `?` after resource type"))?;
        let resource_type = resource_type.trim();
        if resource_type.is_empty() {
            return Err(CandidateError::malformed(query, "empty resource type"));
        }

        let mut conditions = Vec::new();
        for part in rest.split('&').filter(|part| !part.is_empty()) {
            let (name, raw_values) = part
                .split_once('=')
                .ok_or_else(|| CandidateError::malformed(query, format!("`{part}` has no `=`")))?;
            let (param, modifier) = match name.split_once(':') {
                Some((param, modifier)) => {
                    let modifier = QueryModifier::parse(modifier).ok_or_else(|| {
                        CandidateError::malformed(query, format!("unsupported modifier `{modifier}`"))
                    })?;
                    (param, Some(modifier))
                }
                None => (name, None),
            };
            if param.is_empty() {
                return Err(CandidateError::malformed(query, "empty parameter name"));
            }

            let mut values = Vec::new();
            for raw in raw_values.split(VALUE_SEPARATOR).filter(|v| !v.is_empty()) {
                let decoded = urlencoding::decode(raw)
                    .map_err(|e| CandidateError::malformed(query, e.to_string()))?;
                values.push(decoded.into_owned());
            }
            if values.is_empty() {
                return Err(CandidateError::malformed(
                    query,
                    format!("parameter `{param}` has no value"),
                ));
            }
            conditions.push(QueryCondition {
                param: param.to_string(),
                modifier,
                values,
            });
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            conditions,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn conditions(&self) -> &[QueryCondition] {
        &self.conditions
    }

    /// Evaluate the query against `record`.
    ///
    /// Records of another resource type never match. Unknown params are an
    /// error rather than a silent miss.
    pub fn matches(&self, record: &Record, registry: &SearchParamRegistry) -> Result<bool, CandidateError> {
        if record.resource_type() != self.resource_type {
            return Ok(false);
        }
        for condition in &self.conditions {
            let values = registry.values_for(record, &condition.param)?;
            if !condition.matches(&values) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for CandidateQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?", self.resource_type)?;
        for (i, condition) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            f.write_str(&condition.param)?;
            if let Some(modifier) = condition.modifier {
                write!(f, ":{}", modifier.as_str())?;
            }
            f.write_str("=")?;
            for (j, value) in condition.values.iter().enumerate() {
                if j > 0 {
                    write!(f, "{VALUE_SEPARATOR}")?;
                }
                f.write_str(&urlencoding::encode(value))?;
            }
        }
        Ok(())
    }
}

fn value_matches(wanted: &str, value: &FieldValue, exact: bool) -> bool {
    if let Some((system, token)) = wanted.split_once('|') {
        let FieldValue::Identifier {
            system: value_system,
            value: value_token,
        } = value
        else {
            return false;
        };
        return match (system.is_empty(), token.is_empty()) {
            (true, _) => value_system.is_none() && value_token == token,
            (false, true) => value_system.as_deref() == Some(system),
            (false, false) => value_system.as_deref() == Some(system) && value_token == token,
        };
    }

    match value {
        FieldValue::Identifier { value, .. } => value == wanted,
        FieldValue::Text(text) if exact => text == wanted,
        FieldValue::Text(text) => text
            .trim()
            .to_lowercase()
            .starts_with(&wanted.trim().to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SearchParamRegistry {
        SearchParamRegistry::default_fhir()
    }

    fn jose() -> Record {
        Record::new("Patient", "a")
            .with_text("name.given", "Jose")
            .with_text("name.given", "Martin")
            .with_text("name.family", "Fernandez")
            .with_text("active", "true")
            .with_identifier(Some("urn:oid:1.2"), "ABC 123")
    }

    #[test]
    fn parse_decodes_values() {
        let query = CandidateQuery::parse("Patient?identifier=urn%3Aoid%3A1.2%7CABC%20123&given=Jose,Martin").unwrap();
        assert_eq!(query.resource_type(), "Patient");
        assert_eq!(query.conditions().len(), 2);
        assert_eq!(query.conditions()[0].values, vec!["urn:oid:1.2|ABC 123"]);
        assert_eq!(query.conditions()[1].values, vec!["Jose", "Martin"]);
    }

    #[test]
    fn display_reencodes() {
        let text = "Patient?identifier=urn%3Aoid%3A1.2%7CABC%20123&family:exact=Fernandez";
        assert_eq!(CandidateQuery::parse(text).unwrap().to_string(), text);
        assert_eq!(CandidateQuery::parse("Patient?").unwrap().to_string(), "Patient?");
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for bad in ["Patient", "?given=Jose", "Patient?given", "Patient?=Jose", "Patient?given=", "Patient?given:fuzzy=Jo"] {
            let err = CandidateQuery::parse(bad).unwrap_err();
            assert!(matches!(err, CandidateError::MalformedQuery { .. }), "{bad} parsed");
        }
    }

    #[test]
    fn conditions_and_values_combine() {
        let record = jose();
        let hit = CandidateQuery::parse("Patient?given=Pedro,Martin&family=fern").unwrap();
        assert!(hit.matches(&record, &registry()).unwrap());

        let miss = CandidateQuery::parse("Patient?given=Martin&family=Lopez").unwrap();
        assert!(!miss.matches(&record, &registry()).unwrap());

        let exact = CandidateQuery::parse("Patient?family:exact=fernandez").unwrap();
        assert!(!exact.matches(&record, &registry()).unwrap());

        let not = CandidateQuery::parse("Patient?active:not=false").unwrap();
        assert!(not.matches(&record, &registry()).unwrap());
    }

    #[test]
    fn identifier_tokens_match_exactly() {
        let record = jose();
        let reg = registry();
        for (query, expected) in [
            ("Patient?identifier=urn%3Aoid%3A1.2%7CABC%20123", true),
            ("Patient?identifier=urn%3Aoid%3A1.2%7C", true),
            ("Patient?identifier=%7CABC%20123", false),
            ("Patient?identifier=ABC%20123", true),
            ("Patient?identifier=urn%3Aoid%3A9%7CABC%20123", false),
            ("Patient?identifier=ABC", false),
        ] {
            let parsed = CandidateQuery::parse(query).unwrap();
            assert_eq!(parsed.matches(&record, &reg).unwrap(), expected, "{query}");
        }
    }

    #[test]
    fn other_types_never_match() {
        let query = CandidateQuery::new("Practitioner");
        assert!(!query.matches(&jose(), &registry()).unwrap());
        assert!(CandidateQuery::new("Patient").matches(&jose(), &registry()).unwrap());
    }
}
