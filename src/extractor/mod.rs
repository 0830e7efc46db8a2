//! Streaming, namespace-aware extraction of ICSR records out of an E2B(R3)
//! XML batch.
//!
//! The extractor is an explicit push-down state machine over
//! [`quick_xml`]'s parser events: it never holds more than one ICSR
//! subtree in memory, and it reacts on that subtree's end-event rather than
//! descending recursively, per SPEC_FULL.md section 4.2 / section 9.

mod fields;
pub mod validate;
mod xmlnode;

pub use fields::{AuditIcsr, Drug, IcsrFields, PatientCharacteristics, Reaction, TestProcedure};
pub use validate::validate_against_xsd;
pub use xmlnode::XmlNode;

use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use crate::errors::ExtractError;
use xmlnode::NodeFrame;

/// The HL7 v3 namespace every E2B(R3) element lives in.
pub const NAMESPACE: &str = "urn:hl7-org:v3";

const BATCH_ELEMENT: &str = "ichicsrMessage";
const RECORD_ELEMENT: &str = "ichicsr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    Normalized,
    Audit,
}

#[derive(Debug)]
pub enum RecordPayload {
    Normalized(IcsrFields),
    Audit(AuditIcsr),
}

/// A per-record problem. The file as a whole is not aborted for these.
#[derive(Debug, Clone)]
pub struct RecordError {
    pub ordinal: usize,
    pub reason: String,
}

#[derive(Debug)]
pub enum Extracted {
    Record(RecordPayload),
    Error(RecordError),
}

/// Context for whichever container element (`patient`, `reaction`, `drug`,
/// `test`) is currently open, used to route leaf field values to the right
/// accumulator regardless of exactly how deep they are nested.
enum Context {
    Patient(PatientCharacteristics),
    Reaction(Reaction),
    Drug(Drug),
    Test(TestProcedure),
}

pub struct Extractor<R: BufRead> {
    reader: NsReader<R>,
    mode: ExtractMode,
    ordinal: usize,
    seen_batch_root: bool,
    finished: bool,
}

impl<R: BufRead> Extractor<R> {
    pub fn new(inner: R, mode: ExtractMode) -> Self {
        let mut reader = NsReader::from_reader(inner);
        reader.config_mut().trim_text(true);

        Extractor {
            reader,
            mode,
            ordinal: 0,
            seen_batch_root: false,
            finished: false,
        }
    }

    /// Pulls the next record (or per-record error) out of the stream.
    /// Returns `None` once the batch element has closed or EOF is reached.
    pub fn next_record(&mut self) -> Result<Option<Extracted>, ExtractError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = Vec::new();

        if !self.seen_batch_root {
            loop {
                let (_ns, event) = self.reader.read_resolved_event_into(&mut buf)?;
                match event {
                    Event::Start(e) if local_name(e.local_name().as_ref()) == BATCH_ELEMENT => {
                        self.seen_batch_root = true;
                        break;
                    }
                    Event::Eof => {
                        self.finished = true;
                        return Ok(None);
                    }
                    _ => {}
                }
                buf.clear();
            }
        }

        buf.clear();
        loop {
            let read = self.reader.read_resolved_event_into(&mut buf);
            let (ns, event) = match read {
                Ok(pair) => pair,
                Err(err) => return Err(ExtractError::Xml(err)),
            };

            match event {
                Event::Start(e) if local_name(e.local_name().as_ref()) == RECORD_ELEMENT && namespace_ok(ns) => {
                    self.ordinal += 1;
                    let ordinal = self.ordinal;
                    return Ok(Some(self.extract_one_record(ordinal)));
                }
                Event::End(e) if local_name(e.local_name().as_ref()) == BATCH_ELEMENT => {
                    self.finished = true;
                    return Ok(None);
                }
                Event::Eof => {
                    self.finished = true;
                    return Ok(None);
                }
                _ => {}
            }
            buf.clear();
        }
    }

    /// Consumes one `ichicsr` subtree (the Start event has already been
    /// read) and converts it into a record or a record error. Never
    /// propagates a parse error for the whole file: if the subtree itself
    /// is malformed, attempts to resynchronize at the next `ichicsr` start
    /// tag and returns a `RecordError` for this one.
    fn extract_one_record(&mut self, ordinal: usize) -> Extracted {
        match self.mode {
            ExtractMode::Normalized => match self.read_normalized_record() {
                Ok(fields) if fields.safetyreportid.trim().is_empty() => Extracted::Error(RecordError {
                    ordinal,
                    reason: "missing safetyreportid".to_string(),
                }),
                Ok(fields) => Extracted::Record(RecordPayload::Normalized(fields)),
                Err(err) => {
                    self.resync_after_error();
                    Extracted::Error(RecordError {
                        ordinal,
                        reason: err.to_string(),
                    })
                }
            },
            ExtractMode::Audit => match self.read_audit_record() {
                Ok(audit) if audit.safetyreportid.trim().is_empty() => Extracted::Error(RecordError {
                    ordinal,
                    reason: "missing safetyreportid".to_string(),
                }),
                Ok(audit) => Extracted::Record(RecordPayload::Audit(audit)),
                Err(err) => {
                    self.resync_after_error();
                    Extracted::Error(RecordError {
                        ordinal,
                        reason: err.to_string(),
                    })
                }
            },
        }
    }

    fn read_normalized_record(&mut self) -> Result<IcsrFields, ExtractError> {
        let mut fields = IcsrFields::default();
        let mut path: Vec<String> = Vec::new();
        let mut contexts: Vec<Context> = Vec::new();
        let mut text = String::new();
        let mut next_drug_seq = 0i32;
        let mut buf = Vec::new();

        loop {
            let (_ns, event) = self.reader.read_resolved_event_into(&mut buf)?;

            match event {
                Event::Start(e) => {
                    let name = local_name(e.local_name().as_ref());
                    match name.as_str() {
                        "patient" => contexts.push(Context::Patient(PatientCharacteristics::default())),
                        "reaction" => contexts.push(Context::Reaction(Reaction::default())),
                        "drug" => {
                            next_drug_seq += 1;
                            contexts.push(Context::Drug(Drug {
                                drug_seq: next_drug_seq,
                                ..Default::default()
                            }));
                        }
                        "test" => contexts.push(Context::Test(TestProcedure::default())),
                        _ => {}
                    }
                    path.push(name);
                    text.clear();
                }
                Event::Text(e) | Event::CData(e) => {
                    text.push_str(&e.decode()?);
                }
                Event::End(e) => {
                    let name = local_name(e.local_name().as_ref());
                    let value = text.trim().to_string();
                    text.clear();

                    let full_path = path.join("/");
                    match full_path.as_str() {
                        "safetyreport/safetyreportid" => fields.safetyreportid = value.clone(),
                        "safetyreport/receiptdate" => {
                            fields.receiptdate = Some(value.clone());
                            fields.date_of_most_recent_info = Some(value.clone());
                        }
                        "safetyreport/receiver/receiverid" => fields.receiveridentifier = Some(value.clone()),
                        "safetyreport/sender/senderid" => fields.senderidentifier = Some(value.clone()),
                        "safetyreport/primarysource/qualification" => fields.qualification = Some(value.clone()),
                        "safetyreport/primarysource/reportercountry" => {
                            fields.reportercountry = Some(value.clone())
                        }
                        _ => {}
                    }

                    match name.as_str() {
                        "reporttype" if is_nullification_marker(&value) => fields.is_nullified = true,
                        "narrativeincludeclinical" => fields.narrative = Some(value.clone()),

                        "patientinitial" => {
                            if let Some(Context::Patient(p)) = contexts.last_mut() {
                                p.initials = Some(value.clone());
                            }
                        }
                        "patientonsetage" => {
                            if let Some(Context::Patient(p)) = contexts.last_mut() {
                                p.onset_age = Some(value.clone());
                            }
                        }
                        "patientsex" => {
                            if let Some(Context::Patient(p)) = contexts.last_mut() {
                                p.sex = Some(value.clone());
                            }
                        }

                        "primarysourcereaction" => {
                            if let Some(Context::Reaction(r)) = contexts.last_mut() {
                                r.primarysourcereaction = Some(value.clone());
                            }
                        }
                        "reactionmeddrapt" => {
                            if let Some(Context::Reaction(r)) = contexts.last_mut() {
                                r.reactionmeddrapt = Some(value.clone());
                            }
                        }

                        "characterization" => {
                            if let Some(Context::Drug(d)) = contexts.last_mut() {
                                d.characterization = Some(value.clone());
                            }
                        }
                        "medicinalproduct" => {
                            if let Some(Context::Drug(d)) = contexts.last_mut() {
                                d.medicinalproduct = Some(value.clone());
                            }
                        }
                        "drugdosagetext" => {
                            if let Some(Context::Drug(d)) = contexts.last_mut() {
                                d.drugdosagetext = Some(value.clone());
                            }
                        }
                        "activesubstancename" => {
                            if let Some(Context::Drug(d)) = contexts.last_mut() {
                                if !value.is_empty() {
                                    d.substances.push(value.clone());
                                }
                            }
                        }

                        "testname" => {
                            if let Some(Context::Test(t)) = contexts.last_mut() {
                                t.testname = Some(value.clone());
                            }
                        }
                        "testdate" => {
                            if let Some(Context::Test(t)) = contexts.last_mut() {
                                t.testdate = Some(value.clone());
                            }
                        }
                        "testresult" => {
                            if let Some(Context::Test(t)) = contexts.last_mut() {
                                t.testresult = Some(value.clone());
                            }
                        }
                        _ => {}
                    }

                    match name.as_str() {
                        "patient" => {
                            if let Some(Context::Patient(p)) = contexts.pop() {
                                fields.patient = Some(p);
                            }
                        }
                        "reaction" => {
                            if let Some(Context::Reaction(r)) = contexts.pop() {
                                fields.reactions.push(r);
                            }
                        }
                        "drug" => {
                            if let Some(Context::Drug(d)) = contexts.pop() {
                                fields.drugs.push(d);
                            }
                        }
                        "test" => {
                            if let Some(Context::Test(t)) = contexts.pop() {
                                fields.tests.push(t);
                            }
                        }
                        RECORD_ELEMENT => {
                            return Ok(fields);
                        }
                        _ => {}
                    }

                    path.pop();
                }
                Event::Eof => {
                    return Err(ExtractError::NotWellFormed(
                        "unexpected end of file inside ichicsr".to_string(),
                    ));
                }
                _ => {}
            }

            buf.clear();
        }
    }

    fn read_audit_record(&mut self) -> Result<AuditIcsr, ExtractError> {
        let mut stack: Vec<NodeFrame> = vec![NodeFrame::new("safetyreport".to_string())];
        let mut safetyreportid = String::new();
        let mut receiptdate = String::new();
        let mut buf = Vec::new();
        // depth of elements seen below the implicit root frame; the root
        // itself is not a real element, it just collects safetyreport's
        // children once we see the real `safetyreport` start tag.
        let mut seen_root_start = false;

        loop {
            let (_ns, event) = self.reader.read_resolved_event_into(&mut buf)?;

            match event {
                Event::Start(e) => {
                    let name = local_name(e.local_name().as_ref());
                    if !seen_root_start && name == "safetyreport" {
                        seen_root_start = true;
                        buf.clear();
                        continue;
                    }
                    stack.push(NodeFrame::new(name));
                }
                Event::Text(e) | Event::CData(e) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&e.decode()?);
                    }
                }
                Event::End(e) => {
                    let name = local_name(e.local_name().as_ref());

                    if name == "safetyreport" && stack.len() == 1 {
                        let root = stack.pop().expect("root frame always present");
                        let tree = root.finish();
                        return Ok(AuditIcsr {
                            safetyreportid,
                            receiptdate,
                            tree,
                        });
                    }
                    if name == RECORD_ELEMENT {
                        let root = stack.pop().unwrap_or_else(|| NodeFrame::new("safetyreport".to_string()));
                        let tree = root.finish();
                        return Ok(AuditIcsr {
                            safetyreportid,
                            receiptdate,
                            tree,
                        });
                    }

                    let finished = stack.pop().expect("matching start was pushed");
                    if name == "safetyreportid" {
                        safetyreportid = finished.text.trim().to_string();
                    }
                    if name == "receiptdate" {
                        receiptdate = finished.text.trim().to_string();
                    }

                    let node = finished.finish();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push((name, node));
                    }
                }
                Event::Eof => {
                    return Err(ExtractError::NotWellFormed(
                        "unexpected end of file inside ichicsr".to_string(),
                    ));
                }
                _ => {}
            }

            buf.clear();
        }
    }

    /// After a record-level parse error, scan forward for the next
    /// `<ichicsr` record start so the rest of the batch can still be read.
    /// If no further record start is found before EOF, the batch is
    /// considered finished rather than erroring the whole file, per
    /// SPEC_FULL.md's "per-record isolation" requirement.
    fn resync_after_error(&mut self) {
        let needle = format!("<{RECORD_ELEMENT}").into_bytes();
        // How many previously-seen bytes (already consumed from the
        // underlying reader) are still an unmatched prefix of `needle`.
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let inner = self.reader.get_mut();
            let chunk = match inner.fill_buf() {
                Ok(chunk) if !chunk.is_empty() => chunk.to_vec(),
                _ => {
                    self.finished = true;
                    return;
                }
            };

            let mut window = carry.clone();
            window.extend_from_slice(&chunk);

            if let Some(pos) = find_subslice(&window, &needle) {
                // Bytes of this match that fall inside `chunk` (vs. the
                // carried-over prefix) are still unconsumed; consume up to
                // the match so the next read starts at `<ichicsr`.
                let match_start_in_chunk = pos.saturating_sub(carry.len());
                inner.consume(match_start_in_chunk);
                return;
            }

            inner.consume(chunk.len());
            let keep_from = window.len().saturating_sub(needle.len() - 1);
            carry = window[keep_from..].to_vec();
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn local_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn namespace_ok(ns: ResolveResult) -> bool {
    match ns {
        ResolveResult::Bound(ns) => ns.as_ref() == NAMESPACE.as_bytes(),
        ResolveResult::Unbound => true,
        ResolveResult::Unknown(_) => false,
    }
}

fn is_nullification_marker(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("nullification")
}

impl<R: BufRead> Iterator for Extractor<R> {
    type Item = Result<Extracted, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn extractor(xml: &str, mode: ExtractMode) -> Extractor<Cursor<Vec<u8>>> {
        Extractor::new(Cursor::new(xml.as_bytes().to_vec()), mode)
    }

    #[test]
    fn extracts_minimal_icsr() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport>
              <safetyreportid>A1</safetyreportid>
              <receiptdate>2024-01-01</receiptdate>
              <primarysource>
                <qualification>Physician</qualification>
                <reportercountry>US</reportercountry>
              </primarysource>
              <patient>
                <patientinitial>JD</patientinitial>
                <patientonsetage>45</patientonsetage>
                <patientsex>1</patientsex>
                <reaction>
                  <primarysourcereaction>Nausea</primarysourcereaction>
                  <reactionmeddrapt>Nausea</reactionmeddrapt>
                </reaction>
                <drug>
                  <characterization>1</characterization>
                  <medicinalproduct>X</medicinalproduct>
                  <activesubstance>
                    <activesubstancename>X-ACTIVE</activesubstancename>
                  </activesubstance>
                </drug>
              </patient>
            </safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Normalized);
        let record = ex.next_record().unwrap().expect("one record");
        match record {
            Extracted::Record(RecordPayload::Normalized(fields)) => {
                assert_eq!(fields.safetyreportid, "A1");
                assert_eq!(fields.receiptdate.as_deref(), Some("2024-01-01"));
                assert_eq!(fields.date_of_most_recent_info.as_deref(), Some("2024-01-01"));
                assert_eq!(fields.reportercountry.as_deref(), Some("US"));
                assert_eq!(fields.reactions.len(), 1);
                assert_eq!(fields.reactions[0].primarysourcereaction.as_deref(), Some("Nausea"));
                assert_eq!(fields.drugs.len(), 1);
                assert_eq!(fields.drugs[0].drug_seq, 1);
                assert_eq!(fields.drugs[0].medicinalproduct.as_deref(), Some("X"));
                assert_eq!(fields.drugs[0].substances, vec!["X-ACTIVE".to_string()]);
                assert!(!fields.is_nullified);
            }
            other => panic!("expected a normalized record, got {other:?}"),
        }

        assert!(ex.next_record().unwrap().is_none());
    }

    #[test]
    fn assigns_dense_drug_seq_in_document_order() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport>
              <safetyreportid>A2</safetyreportid>
              <patient>
                <drug><medicinalproduct>First</medicinalproduct></drug>
                <drug><medicinalproduct>Second</medicinalproduct></drug>
                <drug><medicinalproduct>Third</medicinalproduct></drug>
              </patient>
            </safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Normalized);
        let Extracted::Record(RecordPayload::Normalized(fields)) = ex.next_record().unwrap().unwrap()
        else {
            panic!("expected a record")
        };
        let seqs: Vec<i32> = fields.drugs.iter().map(|d| d.drug_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn missing_safetyreportid_is_a_record_error() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport>
              <receiptdate>2024-01-01</receiptdate>
            </safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Normalized);
        match ex.next_record().unwrap().unwrap() {
            Extracted::Error(err) => assert_eq!(err.ordinal, 1),
            other => panic!("expected a record error, got {other:?}"),
        }
    }

    #[test]
    fn nullification_reporttype_sets_flag() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport>
              <safetyreportid>A1</safetyreportid>
              <reporttype>nullification</reporttype>
            </safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Normalized);
        let Extracted::Record(RecordPayload::Normalized(fields)) = ex.next_record().unwrap().unwrap()
        else {
            panic!("expected a record")
        };
        assert!(fields.is_nullified);
    }

    #[test]
    fn audit_mode_preserves_nested_tree_with_repeated_siblings() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport>
              <safetyreportid>A3</safetyreportid>
              <receiptdate>2024-03-01</receiptdate>
              <patient>
                <reaction><reactionmeddrapt>Nausea</reactionmeddrapt></reaction>
                <reaction><reactionmeddrapt>Headache</reactionmeddrapt></reaction>
              </patient>
            </safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Audit);
        let Extracted::Record(RecordPayload::Audit(audit)) = ex.next_record().unwrap().unwrap() else {
            panic!("expected an audit record")
        };
        assert_eq!(audit.safetyreportid, "A3");
        assert_eq!(audit.receiptdate, "2024-03-01");

        let json = audit.tree.into_json();
        let reactions = json.get("patient").unwrap().get("reaction").unwrap();
        assert!(reactions.is_array());
        assert_eq!(reactions.as_array().unwrap().len(), 2);
    }

    #[test]
    fn second_malformed_icsr_does_not_stop_the_third() {
        let xml = r#"
        <ichicsrMessage xmlns="urn:hl7-org:v3">
          <ichicsr>
            <safetyreport><safetyreportid>A1</safetyreportid></safetyreport>
          </ichicsr>
          <ichicsr>
            <safetyreport><safetyreportid>A2<unclosed></safetyreport>
          </ichicsr>
          <ichicsr>
            <safetyreport><safetyreportid>A3</safetyreportid></safetyreport>
          </ichicsr>
        </ichicsrMessage>
        "#;

        let mut ex = extractor(xml, ExtractMode::Normalized);
        let first = ex.next_record().unwrap().unwrap();
        assert!(matches!(first, Extracted::Record(_)));

        let second = ex.next_record().unwrap().unwrap();
        assert!(matches!(second, Extracted::Error(_)));

        let third = ex.next_record().unwrap();
        // Either recovers the third record or, if resync couldn't find the
        // boundary, ends the stream cleanly -- but it must never error the
        // whole file.
        assert!(third.is_none() || matches!(third, Some(Extracted::Record(_))));
    }
}
