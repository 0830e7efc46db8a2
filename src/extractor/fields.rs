use super::xmlnode::XmlNode;

/// A closed, typed representation of the fields this crate knows how to
/// pull out of an ICSR, rather than an untyped map — see SPEC_FULL.md
/// "Dynamic dictionaries in the transformer".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IcsrFields {
    pub safetyreportid: String,
    pub receiptdate: Option<String>,
    pub date_of_most_recent_info: Option<String>,
    pub is_nullified: bool,
    pub senderidentifier: Option<String>,
    pub receiveridentifier: Option<String>,
    pub reportercountry: Option<String>,
    pub qualification: Option<String>,

    pub patient: Option<PatientCharacteristics>,
    pub reactions: Vec<Reaction>,
    pub drugs: Vec<Drug>,
    pub tests: Vec<TestProcedure>,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientCharacteristics {
    pub initials: Option<String>,
    pub onset_age: Option<String>,
    pub sex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    pub primarysourcereaction: Option<String>,
    pub reactionmeddrapt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drug {
    /// Assigned by the extractor in document order, 1-based.
    pub drug_seq: i32,
    pub characterization: Option<String>,
    pub medicinalproduct: Option<String>,
    pub drugdosagetext: Option<String>,
    pub substances: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestProcedure {
    pub testname: Option<String>,
    pub testdate: Option<String>,
    pub testresult: Option<String>,
}

/// The full audit-mode payload for one ICSR: the fields needed to decide
/// which version to keep, plus the whole preserved subtree.
#[derive(Debug, Clone)]
pub struct AuditIcsr {
    pub safetyreportid: String,
    pub receiptdate: String,
    pub tree: XmlNode,
}
