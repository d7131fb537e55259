//! Duplicate cluster discovery and the interactive resolution loop.
//!
//! Clusters are built first-cluster-wins: once a record has been collected
//! into a cluster it is never offered again, even if it would also match a
//! later record outside that cluster.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};

use colored::Colorize;

use crate::config::Config;
use crate::record::{Record, RecordStore, RemovalSet};
use crate::similarity::{Score, SimilarityEngine};

/// A record inside a cluster. The seed has no score of its own.
#[derive(Debug, Clone, Copy)]
pub struct Member<'a> {
    pub record: &'a Record,
    pub score: Option<Score>,
}

/// Two or more records judged duplicates of the cluster's seed.
#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub members: Vec<Member<'a>>,
}

impl<'a> Cluster<'a> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn seed(&self) -> &'a Record {
        self.members[0].record
    }

    pub fn sequence_ids(&self) -> Vec<usize> {
        self.members.iter().map(|m| m.record.sequence_id).collect()
    }
}

/// Lazily walks the store and yields one cluster per unresolved seed that has
/// at least one duplicate.
pub struct ClusterScanner<'a> {
    store: &'a RecordStore,
    engine: SimilarityEngine,
    resolved: HashSet<usize>,
    cursor: usize,
}

impl<'a> ClusterScanner<'a> {
    pub fn new(store: &'a RecordStore, engine: SimilarityEngine) -> Self {
        Self {
            store,
            engine,
            resolved: HashSet::new(),
            cursor: 0,
        }
    }

    /// Number of store positions visited so far.
    pub fn scanned(&self) -> usize {
        self.cursor
    }
}

impl<'a> Iterator for ClusterScanner<'a> {
    type Item = Cluster<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let store = self.store;
        while let Some(seed) = store.get(self.cursor) {
            let position = self.cursor;
            self.cursor += 1;

            if self.resolved.contains(&seed.sequence_id) {
                continue;
            }

            // Unresolved records before the seed had no partner, and scores
            // are symmetric, so only later records can join.
            let partners: Vec<Member<'a>> = store
                .iter()
                .skip(position + 1)
                .filter(|other| !self.resolved.contains(&other.sequence_id))
                .filter_map(|other| {
                    self.engine
                        .duplicate_score(seed, other)
                        .map(|score| Member {
                            record: other,
                            score: Some(score),
                        })
                })
                .collect();

            if partners.is_empty() {
                continue;
            }

            let mut members = Vec::with_capacity(partners.len() + 1);
            members.push(Member {
                record: seed,
                score: None,
            });
            members.extend(partners);
            for member in &members {
                self.resolved.insert(member.record.sequence_id);
            }

            let cluster = Cluster { members };
            tracing::debug!(
                seed = seed.domain_id,
                members = ?cluster.sequence_ids(),
                "duplicate cluster found"
            );
            return Some(cluster);
        }
        None
    }
}

/// Report-only discovery: every cluster the resolution loop would present.
pub fn discover_clusters(store: &RecordStore, engine: SimilarityEngine) -> Vec<Cluster<'_>> {
    ClusterScanner::new(store, engine).collect()
}

/// Narrow line-reading capability so the loop can run without a terminal.
pub trait LineSource {
    /// Next line of operator input, `None` once input is closed.
    fn next_line(&mut self) -> io::Result<Option<String>>;
}

impl<R: BufRead> LineSource for R {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

/// One parsed line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Terminate,
    Skip,
    /// 1-based cluster positions, deduplicated, in the order given.
    Select(Vec<usize>),
    Invalid(String),
}

pub fn parse_reply(line: &str, cluster_size: usize, keyword: &str) -> Reply {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case(keyword.trim()) {
        return Reply::Terminate;
    }
    if trimmed.is_empty() {
        return Reply::Skip;
    }

    let mut picks = Vec::new();
    for token in trimmed.split_whitespace() {
        if !token.bytes().all(|b| b.is_ascii_digit()) {
            return Reply::Invalid(format!("'{token}' is not a question number"));
        }
        match token.parse::<usize>() {
            Ok(n) if (1..=cluster_size).contains(&n) => {
                if !picks.contains(&n) {
                    picks.push(n);
                }
            }
            Ok(n) => {
                return Reply::Invalid(format!("{n} is outside 1..={cluster_size}"));
            }
            Err(_) => {
                return Reply::Invalid(format!("'{token}' is not a question number"));
            }
        }
    }
    Reply::Select(picks)
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every record was considered.
    Exhausted,
    /// Operator entered the termination keyword.
    Terminated,
    /// Input ended without the keyword; handled like termination.
    InputClosed,
}

impl Outcome {
    pub fn is_complete(self) -> bool {
        self == Self::Exhausted
    }
}

#[derive(Debug)]
pub enum State<'a> {
    Scanning,
    PresentingCluster(Cluster<'a>),
    AwaitingInput(Cluster<'a>),
    ApplyingSelection {
        cluster: Cluster<'a>,
        picks: Vec<usize>,
    },
    Terminated(Outcome),
}

#[derive(Debug)]
pub enum Event<'a> {
    ClusterFound(Cluster<'a>),
    StoreExhausted,
    Presented,
    Reply(Reply),
    InputClosed,
    Applied,
}

/// Pure state transition. Events that do not apply to a state leave it unchanged.
pub fn transition<'a>(state: State<'a>, event: Event<'a>) -> State<'a> {
    match (state, event) {
        (State::Scanning, Event::ClusterFound(cluster)) => State::PresentingCluster(cluster),
        (State::Scanning, Event::StoreExhausted) => State::Terminated(Outcome::Exhausted),
        (State::PresentingCluster(cluster), Event::Presented) => State::AwaitingInput(cluster),
        (State::AwaitingInput(cluster), Event::Reply(reply)) => match reply {
            Reply::Terminate => State::Terminated(Outcome::Terminated),
            Reply::Skip => State::Scanning,
            Reply::Select(picks) => State::ApplyingSelection { cluster, picks },
            Reply::Invalid(_) => State::AwaitingInput(cluster),
        },
        (State::AwaitingInput(_), Event::InputClosed) => State::Terminated(Outcome::InputClosed),
        (State::ApplyingSelection { .. }, Event::Applied) => State::Scanning,
        (state, _) => state,
    }
}

/// Result handed to the exporter.
#[derive(Debug)]
pub struct Resolution {
    pub removals: RemovalSet,
    pub outcome: Outcome,
    pub clusters_presented: usize,
    /// Store positions the scanner reached before the loop ended.
    pub records_scanned: usize,
}

/// Drives the scanner and the operator prompt, accumulating a removal set.
pub struct Resolver<'a> {
    scanner: ClusterScanner<'a>,
    classifiers: &'a HashMap<i64, String>,
    keyword: String,
    removals: RemovalSet,
    clusters_presented: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a RecordStore,
        config: &Config,
        classifiers: &'a HashMap<i64, String>,
    ) -> Self {
        Self {
            scanner: ClusterScanner::new(store, SimilarityEngine::new(config.similarity_threshold)),
            classifiers,
            keyword: config.termination_keyword.trim().to_string(),
            removals: RemovalSet::new(),
            clusters_presented: 0,
        }
    }

    pub fn run(
        mut self,
        input: &mut impl LineSource,
        out: &mut impl Write,
    ) -> io::Result<Resolution> {
        let mut state = State::Scanning;

        let outcome = loop {
            let event = match &state {
                State::Scanning => match self.scanner.next() {
                    Some(cluster) => Event::ClusterFound(cluster),
                    None => Event::StoreExhausted,
                },
                State::PresentingCluster(cluster) => {
                    self.clusters_presented += 1;
                    self.present(cluster, out)?;
                    Event::Presented
                }
                State::AwaitingInput(cluster) => {
                    write!(
                        out,
                        "Questions to remove (e.g. \"2 3\"), Enter to keep all, '{}' to stop: ",
                        self.keyword
                    )?;
                    out.flush()?;
                    match input.next_line()? {
                        Some(line) => {
                            let reply = parse_reply(&line, cluster.len(), &self.keyword);
                            if let Reply::Invalid(reason) = &reply {
                                writeln!(out, "{} {}", "Invalid selection:".red(), reason)?;
                            }
                            Event::Reply(reply)
                        }
                        None => {
                            writeln!(out)?;
                            Event::InputClosed
                        }
                    }
                }
                State::ApplyingSelection { cluster, picks } => {
                    self.apply(cluster, picks, out)?;
                    Event::Applied
                }
                State::Terminated(outcome) => break *outcome,
            };
            state = transition(state, event);
        };

        self.report_end(outcome, out)?;

        Ok(Resolution {
            removals: self.removals,
            outcome,
            clusters_presented: self.clusters_presented,
            records_scanned: self.scanner.scanned(),
        })
    }

    fn present(&self, cluster: &Cluster<'_>, out: &mut impl Write) -> io::Result<()> {
        writeln!(out)?;
        writeln!(
            out,
            "{} {} ({} questions)",
            "DUP".yellow().bold(),
            self.clusters_presented,
            cluster.len()
        )?;

        for (i, member) in cluster.members.iter().enumerate() {
            let record = member.record;
            let score = match member.score {
                Some(score) => format!("{}%", score.value),
                None => "seed".to_string(),
            };
            writeln!(
                out,
                "  {}: QID={} row {} [{}] {}",
                (i + 1).to_string().cyan().bold(),
                record.domain_id,
                record.source_row,
                record.category,
                score.dimmed()
            )?;
            writeln!(out, "     {}", record.text)?;

            if !record.answers.is_empty() {
                let answers: Vec<String> = record
                    .answers
                    .iter()
                    .map(|(text, score)| format!("{text} ({score})"))
                    .collect();
                writeln!(out, "     {} {}", "Answers:".dimmed(), answers.join(", "))?;
            }

            if let Some(text) = record.document_ref.and_then(|r| self.classifiers.get(&r)) {
                writeln!(out, "     {} {}", "Classifier:".dimmed(), text)?;
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        cluster: &Cluster<'_>,
        picks: &[usize],
        out: &mut impl Write,
    ) -> io::Result<()> {
        for &pick in picks {
            let Some(member) = cluster.members.get(pick - 1) else {
                continue;
            };
            let qid = member.record.domain_id;
            if self.removals.insert(qid) {
                tracing::info!(qid, "marked for removal");
                writeln!(out, "{}", format!("QID={qid} marked for removal").green())?;
            } else {
                writeln!(out, "{}", format!("QID={qid} already marked").dimmed())?;
            }
        }
        Ok(())
    }

    fn report_end(&self, outcome: Outcome, out: &mut impl Write) -> io::Result<()> {
        writeln!(out)?;
        match outcome {
            Outcome::Exhausted => writeln!(
                out,
                "All questions checked: {} duplicate cluster(s) reviewed.",
                self.clusters_presented
            )?,
            Outcome::Terminated | Outcome::InputClosed => {
                let why = if outcome == Outcome::Terminated {
                    "Stopped by operator"
                } else {
                    "Input closed"
                };
                writeln!(
                    out,
                    "{}",
                    format!(
                        "WARNING: {why} after {} cluster(s); later questions were never checked for duplicates.",
                        self.clusters_presented
                    )
                    .yellow()
                )?;
            }
        }
        writeln!(out, "{} question(s) marked for removal.", self.removals.len())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn no_color() {
        colored::control::set_override(false);
    }

    fn run(store: &RecordStore, threshold: u8, input: &str) -> (Resolution, String) {
        no_color();
        let config = Config {
            similarity_threshold: threshold,
            ..Config::default()
        };
        let classifiers = HashMap::new();
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut transcript = Vec::new();
        let resolution = Resolver::new(store, &config, &classifiers)
            .run(&mut reader, &mut transcript)
            .unwrap();
        (resolution, String::from_utf8(transcript).unwrap())
    }

    /// `pairs` clusters of two, adjacent in the store.
    fn paired_store(pairs: usize) -> RecordStore {
        let mut records = Vec::new();
        for p in 0..pairs {
            let text = format!("question number {p}");
            records.push(test_record(2 * p, 10_000 + 2 * p as i64, "A", &text));
            records.push(test_record(2 * p + 1, 10_001 + 2 * p as i64, "A", &text.to_uppercase()));
        }
        RecordStore::new(records)
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("  EXIT \n", 3, "exit"), Reply::Terminate);
        assert_eq!(parse_reply("\n", 3, "exit"), Reply::Skip);
        assert_eq!(parse_reply("   ", 3, "exit"), Reply::Skip);
        assert_eq!(parse_reply("2 3\n", 3, "exit"), Reply::Select(vec![2, 3]));
        assert_eq!(parse_reply("3  1 3", 3, "exit"), Reply::Select(vec![3, 1]));
        assert!(matches!(parse_reply("0", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("4", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("1,2", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("quit", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("-1", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("+2", 3, "exit"), Reply::Invalid(_)));
        assert!(matches!(parse_reply("1 +3", 3, "exit"), Reply::Invalid(_)));
    }

    #[test]
    fn test_transition_table() {
        let store = paired_store(1);
        let cluster = discover_clusters(&store, SimilarityEngine::new(99)).remove(0);

        let s = transition(State::Scanning, Event::ClusterFound(cluster.clone()));
        assert!(matches!(s, State::PresentingCluster(_)));
        let s = transition(s, Event::Presented);
        assert!(matches!(s, State::AwaitingInput(_)));
        let s = transition(s, Event::Reply(Reply::Invalid("bad".to_string())));
        assert!(matches!(s, State::AwaitingInput(_)));
        let s = transition(s, Event::Reply(Reply::Select(vec![2])));
        assert!(matches!(s, State::ApplyingSelection { ref picks, .. } if picks == &vec![2]));
        let s = transition(s, Event::Applied);
        assert!(matches!(s, State::Scanning));
        let s = transition(s, Event::StoreExhausted);
        assert!(matches!(s, State::Terminated(Outcome::Exhausted)));

        let waiting = State::AwaitingInput(cluster.clone());
        assert!(matches!(
            transition(waiting, Event::Reply(Reply::Terminate)),
            State::Terminated(Outcome::Terminated)
        ));
        let waiting = State::AwaitingInput(cluster.clone());
        assert!(matches!(
            transition(waiting, Event::Reply(Reply::Skip)),
            State::Scanning
        ));
        let waiting = State::AwaitingInput(cluster);
        assert!(matches!(
            transition(waiting, Event::InputClosed),
            State::Terminated(Outcome::InputClosed)
        ));

        // Terminated absorbs everything
        assert!(matches!(
            transition(State::Terminated(Outcome::Terminated), Event::StoreExhausted),
            State::Terminated(Outcome::Terminated)
        ));
    }

    #[test]
    fn test_category_scenario() {
        let store = RecordStore::new(vec![
            test_record(0, 10001, "A", "What is X?"),
            test_record(1, 10002, "A", "what is x"),
            test_record(2, 10003, "B", "What is X?"),
        ]);
        let clusters = discover_clusters(&store, SimilarityEngine::new(99));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].sequence_ids(), vec![0, 1]);
    }

    #[test]
    fn test_select_positions_in_large_cluster() {
        let store = RecordStore::new(
            (0..5)
                .map(|i| test_record(i, 10_001 + i as i64, "A", "Same question"))
                .collect(),
        );
        let (resolution, transcript) = run(&store, 99, "2 4\n");

        assert_eq!(resolution.removals.iter().collect::<Vec<_>>(), vec![10002, 10004]);
        assert_eq!(resolution.outcome, Outcome::Exhausted);
        assert!(transcript.contains("QID=10002 marked for removal"));
        assert!(transcript.contains("QID=10004 marked for removal"));
        assert!(!transcript.contains("QID=10001 marked"));
    }

    #[test]
    fn test_terminate_on_second_cluster() {
        let store = paired_store(5);
        let (resolution, transcript) = run(&store, 99, "2\nexit\n1 2\n");

        assert_eq!(resolution.outcome, Outcome::Terminated);
        assert_eq!(resolution.clusters_presented, 2);
        assert_eq!(resolution.removals.iter().collect::<Vec<_>>(), vec![10001]);
        // Seed of the second cluster is at position 2; nothing past it was visited
        assert_eq!(resolution.records_scanned, 3);
        assert!(transcript.contains("Stopped by operator after 2 cluster(s)"));
    }

    #[test]
    fn test_invalid_input_reprompts() {
        let store = paired_store(1);
        let (resolution, transcript) = run(&store, 99, "abc\n0\n3\n1\n");

        assert_eq!(transcript.matches("Invalid selection:").count(), 3);
        assert_eq!(transcript.matches("Questions to remove").count(), 4);
        assert_eq!(resolution.removals.iter().collect::<Vec<_>>(), vec![10000]);
        assert_eq!(resolution.outcome, Outcome::Exhausted);
    }

    #[test]
    fn test_empty_line_keeps_all() {
        let store = paired_store(3);
        let (resolution, transcript) = run(&store, 99, "\n\n\n");

        assert!(resolution.removals.is_empty());
        assert_eq!(resolution.clusters_presented, 3);
        assert_eq!(resolution.outcome, Outcome::Exhausted);
        assert!(transcript.contains("All questions checked: 3 duplicate cluster(s) reviewed."));
    }

    #[test]
    fn test_input_closed_is_implicit_termination() {
        let store = paired_store(2);
        let (resolution, transcript) = run(&store, 99, "2\n");

        assert_eq!(resolution.outcome, Outcome::InputClosed);
        assert!(!resolution.outcome.is_complete());
        assert_eq!(resolution.clusters_presented, 2);
        assert_eq!(resolution.removals.iter().collect::<Vec<_>>(), vec![10001]);
        assert!(transcript.contains("Input closed after 2 cluster(s)"));
    }

    #[test]
    fn test_no_duplicates_never_prompts() {
        let store = RecordStore::new(vec![
            test_record(0, 10001, "A", "alpha"),
            test_record(1, 10002, "A", "beta"),
        ]);
        let (resolution, transcript) = run(&store, 99, "");

        assert_eq!(resolution.outcome, Outcome::Exhausted);
        assert_eq!(resolution.clusters_presented, 0);
        assert_eq!(resolution.records_scanned, 2);
        assert!(!transcript.contains("Questions to remove"));
    }

    #[test]
    fn test_first_cluster_wins() {
        // 0 ~ 1 and 1 ~ 2, but 0 !~ 2: record 2 is left alone once 1 is absorbed
        let store = RecordStore::new(vec![
            test_record(0, 10001, "A", "capital city france"),
            test_record(1, 10002, "A", "capital city france paris"),
            test_record(2, 10003, "A", "city france paris"),
        ]);
        let engine = SimilarityEngine::new(60);
        let a = store.get(0).unwrap();
        let b = store.get(1).unwrap();
        let c = store.get(2).unwrap();
        assert!(engine.duplicate_score(a, b).is_some());
        assert!(engine.duplicate_score(b, c).is_some());
        assert!(engine.duplicate_score(a, c).is_none());

        let clusters = discover_clusters(&store, engine);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].sequence_ids(), vec![0, 1]);
    }

    #[test]
    fn test_classifier_context_is_shown() {
        no_color();
        let mut first = test_record(0, 10001, "A", "Same");
        first.document_ref = Some(7);
        let store = RecordStore::new(vec![first, test_record(1, 10002, "A", "same")]);
        let classifiers = HashMap::from([(7, "Road signs, chapter 2".to_string())]);
        let config = Config::default();

        let mut transcript = Vec::new();
        Resolver::new(&store, &config, &classifiers)
            .run(&mut Cursor::new(b"\n".to_vec()), &mut transcript)
            .unwrap();
        let transcript = String::from_utf8(transcript).unwrap();

        assert!(transcript.contains("Classifier: Road signs, chapter 2"));
        assert!(transcript.contains("Answers: yes (0), no (1), maybe (2)"));
    }

    fn arb_store() -> impl Strategy<Value = RecordStore> {
        let words = prop::sample::select(vec!["alpha", "beta", "gamma", "delta", "Alpha?"]);
        prop::collection::vec(
            (prop::sample::select(vec!["A", "B"]), prop::collection::vec(words, 1..4)),
            0..14,
        )
        .prop_map(|rows| {
            RecordStore::new(
                rows.into_iter()
                    .enumerate()
                    .map(|(i, (cat, words))| test_record(i, 10_000 + (i % 4) as i64, cat, &words.join(" ")))
                    .collect(),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_discovery_is_idempotent(store in arb_store(), threshold in prop::sample::select(vec![40u8, 70, 99, 100])) {
            let engine = SimilarityEngine::new(threshold);
            let first: Vec<Vec<usize>> = discover_clusters(&store, engine).iter().map(Cluster::sequence_ids).collect();
            let second: Vec<Vec<usize>> = discover_clusters(&store, engine).iter().map(Cluster::sequence_ids).collect();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_clusters_are_disjoint(store in arb_store(), threshold in prop::sample::select(vec![40u8, 70, 99])) {
            let mut seen = HashSet::new();
            for cluster in discover_clusters(&store, SimilarityEngine::new(threshold)) {
                prop_assert!(cluster.len() >= 2);
                prop_assert!(cluster.members[0].score.is_none());
                prop_assert!(cluster.members[1..].iter().all(|m| m.score.is_some()));
                for id in cluster.sequence_ids() {
                    prop_assert!(seen.insert(id), "sequence id {} presented twice", id);
                }
            }
        }

        #[test]
        fn prop_removals_come_from_presented_clusters(store in arb_store(), picks in "[1-3 ]{0,6}") {
            let clusters = discover_clusters(&store, SimilarityEngine::new(99));
            let presented: HashSet<i64> = clusters
                .iter()
                .flat_map(|c| c.members.iter().map(|m| m.record.domain_id))
                .collect();

            let input = format!("{picks}\n").repeat(clusters.len());
            let (resolution, _) = run(&store, 99, &input);
            for qid in resolution.removals.iter() {
                prop_assert!(presented.contains(&qid));
            }
        }
    }
}
