use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ml::options::ModelOptions;

use super::{
    corpus::{next_lines_or_end, tokenize, ParallelCorpus},
    vocab::{Vocab, UNK},
};

pub use builder::TextIteratorBuilder;

/// Source tokens (one index per factor) and target token indices, aligned by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub source: Vec<Vec<Vec<usize>>>,
    pub target: Vec<Vec<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

/// Buffering, filtering and batching settings shared by the corpus iterators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorSettings {
    pub batch_size: usize,
    pub maxlen: usize,
    pub n_words_source: Option<usize>,
    pub n_words_target: Option<usize>,
    pub skip_empty: bool,
    pub shuffle_each_epoch: bool,
    pub sort_by_length: bool,
    pub use_factor: bool,
    pub maxibatch_size: usize,
}

impl Default for IteratorSettings {
    fn default() -> Self {
        Self {
            batch_size: 128,
            maxlen: 100,
            n_words_source: None,
            n_words_target: None,
            skip_empty: false,
            shuffle_each_epoch: false,
            sort_by_length: true,
            use_factor: false,
            maxibatch_size: 20,
        }
    }
}

impl IteratorSettings {
    pub fn from_options(options: &ModelOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            maxlen: options.maxlen,
            n_words_source: Some(options.n_words_src),
            n_words_target: Some(options.n_words),
            skip_empty: options.skip_empty,
            shuffle_each_epoch: options.shuffle_each_epoch,
            sort_by_length: options.sort_by_length,
            use_factor: options.use_factor(),
            maxibatch_size: options.maxibatch_size,
        }
    }

    /// Lookahead buffer size, `batch_size × maxibatch_size`.
    pub fn buffer_capacity(&self) -> usize {
        self.batch_size * self.maxibatch_size
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.maxibatch_size == 0 {
            return Err(anyhow!(
                "batch_size and maxibatch_size must be non-zero, got {} and {}",
                self.batch_size,
                self.maxibatch_size
            ));
        }
        Ok(())
    }

    /// True when any side of an example fails the emptiness or length filters.
    pub(crate) fn rejects(&self, sides: &[&[String]]) -> bool {
        if self.skip_empty && sides.iter().any(|x| x.is_empty()) {
            return true;
        }
        sides.iter().any(|x| x.len() > self.maxlen)
    }

    pub(crate) fn map_source(&self, tokens: &[String], dicts: &[Vocab], unfactored_dict: usize) -> Vec<Vec<usize>> {
        tokens
            .iter()
            .map(|token| {
                if self.use_factor {
                    // missing factors fall back to UNK
                    let mut factors = token.split('|');
                    dicts
                        .iter()
                        .map(|dict| factors.next().map_or(UNK, |factor| dict.lookup(factor)))
                        .collect()
                } else {
                    vec![dicts
                        .get(unfactored_dict)
                        .map_or(UNK, |dict| dict.lookup(token))]
                }
            })
            .collect()
    }

    pub(crate) fn map_target(&self, tokens: &[String], dict: &Vocab) -> Vec<usize> {
        tokens
            .iter()
            .map(|token| dict.lookup(token))
            .map(|id| match self.n_words_target {
                Some(n_words) if id >= n_words => UNK,
                _ => id,
            })
            .collect()
    }

    /// Order in which buffered examples are laid out before popping from the end.
    pub(crate) fn buffer_order(&self, target_buffer: &[Vec<String>]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..target_buffer.len()).collect();
        if self.sort_by_length {
            order.sort_by_key(|&idx| target_buffer[idx].len());
        } else {
            order.reverse();
        }
        order
    }
}

pub(crate) fn load_dicts(
    source_dicts: &[PathBuf],
    target_dict: &Path,
    settings: &IteratorSettings,
) -> Result<(Vec<Vocab>, Vocab)> {
    let mut sources = source_dicts
        .iter()
        .map(Vocab::load_json)
        .collect::<Result<Vec<_>>>()?;
    let mut target = Vocab::load_json(target_dict)?;

    if let Some(n_words) = settings.n_words_source {
        sources.iter_mut().for_each(|dict| dict.prune(n_words));
    }
    if let Some(n_words) = settings.n_words_target {
        target.prune(n_words);
    }
    Ok((sources, target))
}

pub(crate) fn permute<T>(buffer: &mut Vec<T>, order: &[usize]) {
    let mut taken: Vec<Option<T>> = buffer.drain(..).map(Some).collect();
    buffer.extend(order.iter().filter_map(|&idx| taken[idx].take()));
}

/// Streams minibatches of index sequences from an aligned source/target corpus.
///
/// Returns `None` once per pass, after which the iterator has already been reset.
pub struct TextIterator {
    corpus: ParallelCorpus,
    source_dicts: Vec<Vocab>,
    target_dict: Vocab,
    settings: IteratorSettings,
    source_buffer: Vec<Vec<String>>,
    target_buffer: Vec<Vec<String>>,
    end_of_data: bool,
}

impl TextIterator {
    pub fn new_builder<P: AsRef<Path>>(source: P, target: P) -> TextIteratorBuilder {
        TextIteratorBuilder::new(source.as_ref(), target.as_ref())
    }

    pub fn settings(&self) -> &IteratorSettings {
        &self.settings
    }

    pub fn source_dicts(&self) -> &[Vocab] {
        &self.source_dicts
    }

    pub fn target_dict(&self) -> &Vocab {
        &self.target_dict
    }

    pub fn buffered(&self) -> usize {
        self.target_buffer.len()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn reset(&mut self) -> Result<()> {
        self.source_buffer.clear();
        self.target_buffer.clear();
        self.end_of_data = false;
        self.corpus.reset()
    }

    fn fill(&mut self) {
        let capacity = self.settings.buffer_capacity();
        while self.source_buffer.len() < capacity {
            let Some(lines) = next_lines_or_end(&mut self.corpus) else {
                // the readers may be mid-line after a failure, so no refill before a reset
                self.end_of_data = true;
                break;
            };
            let (source, target) = (tokenize(&lines[0]), tokenize(&lines[1]));
            if self.settings.rejects(&[&source, &target]) {
                continue;
            }
            self.source_buffer.push(source);
            self.target_buffer.push(target);
        }

        let order = self.settings.buffer_order(&self.target_buffer);
        permute(&mut self.source_buffer, &order);
        permute(&mut self.target_buffer, &order);
        debug!(buffered = self.target_buffer.len(), "filled lookahead buffer");
    }

    fn end_pass(&mut self) {
        if let Err(err) = self.reset() {
            warn!("failed to reset corpus: {err:#}");
        }
    }
}

impl Iterator for TextIterator {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        assert_eq!(
            self.source_buffer.len(),
            self.target_buffer.len(),
            "buffer size mismatch"
        );
        if self.target_buffer.is_empty() {
            if self.end_of_data {
                self.end_pass();
                return None;
            }
            self.fill();
            if self.target_buffer.is_empty() {
                self.end_pass();
                return None;
            }
        }

        let mut batch = Batch::default();
        while batch.len() < self.settings.batch_size {
            let (Some(source), Some(target)) = (self.source_buffer.pop(), self.target_buffer.pop())
            else {
                break;
            };
            batch
                .source
                .push(self.settings.map_source(&source, &self.source_dicts, 0));
            batch
                .target
                .push(self.settings.map_target(&target, &self.target_dict));
        }
        Some(batch)
    }
}

mod builder {
    use std::path::{Path, PathBuf};

    use anyhow::Result;

    use crate::ml::{
        data::corpus::{ParallelCorpus, ShuffleService, TempFileShuffler},
        RngStrategy,
    };

    use super::{load_dicts, IteratorSettings, TextIterator};

    pub struct TextIteratorBuilder {
        source: PathBuf,
        target: PathBuf,
        source_dicts: Vec<PathBuf>,
        target_dict: Option<PathBuf>,
        settings: IteratorSettings,
        shuffler: Option<Box<dyn ShuffleService>>,
    }

    impl TextIteratorBuilder {
        pub fn new(source: &Path, target: &Path) -> Self {
            Self {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                source_dicts: vec![],
                target_dict: None,
                settings: IteratorSettings::default(),
                shuffler: None,
            }
        }

        pub fn build(self) -> Result<TextIterator> {
            self.settings.validate()?;
            let target_dict = self
                .target_dict
                .ok_or_else(|| anyhow::anyhow!("missing target vocabulary"))?;
            if self.source_dicts.is_empty() {
                return Err(anyhow::anyhow!("missing source vocabulary"));
            }
            let (source_dicts, target_dict) =
                load_dicts(&self.source_dicts, &target_dict, &self.settings)?;

            let shuffler = match (self.settings.shuffle_each_epoch, self.shuffler) {
                (true, Some(shuffler)) => Some(shuffler),
                (true, None) => Some(Box::new(TempFileShuffler::new(RngStrategy::default()))
                    as Box<dyn ShuffleService>),
                (false, _) => None,
            };
            let corpus = ParallelCorpus::open(vec![self.source, self.target], shuffler)?;

            Ok(TextIterator {
                corpus,
                source_dicts,
                target_dict,
                settings: self.settings,
                source_buffer: vec![],
                target_buffer: vec![],
                end_of_data: false,
            })
        }

        pub fn with_source_dicts<P: AsRef<Path>>(mut self, source_dicts: &[P]) -> Self {
            self.source_dicts = source_dicts.iter().map(|x| x.as_ref().to_path_buf()).collect();
            self
        }

        pub fn with_target_dict<P: AsRef<Path>>(mut self, target_dict: P) -> Self {
            self.target_dict = Some(target_dict.as_ref().to_path_buf());
            self
        }

        pub fn with_settings(mut self, settings: IteratorSettings) -> Self {
            self.settings = settings;
            self
        }

        pub fn with_batch_size(mut self, batch_size: usize) -> Self {
            self.settings.batch_size = batch_size;
            self
        }

        pub fn with_maxlen(mut self, maxlen: usize) -> Self {
            self.settings.maxlen = maxlen;
            self
        }

        pub fn with_maxibatch_size(mut self, maxibatch_size: usize) -> Self {
            self.settings.maxibatch_size = maxibatch_size;
            self
        }

        /// Enables reshuffling on every reset through the given service.
        pub fn with_shuffler(mut self, shuffler: Box<dyn ShuffleService>) -> Self {
            self.settings.shuffle_each_epoch = true;
            self.shuffler = Some(shuffler);
            self
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use test_log::test;

    use crate::ml::{data::corpus::TempFileShuffler, RngStrategy};

    use super::*;

    pub(crate) fn fixture(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("plane_iterator_{name}"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub(crate) fn word_dict(name: &str, words: &[&str]) -> PathBuf {
        let entries: Vec<String> = ["eos", "UNK"]
            .iter()
            .chain(words)
            .enumerate()
            .map(|(idx, word)| format!("\"{word}\": {idx}"))
            .collect();
        fixture(name, &format!("{{{}}}", entries.join(", ")))
    }

    fn numbered_corpus(name: &str, lengths: &[usize]) -> (PathBuf, PathBuf) {
        let source: Vec<String> = lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| vec![format!("s{}", i % 4); len].join(" "))
            .collect();
        let target: Vec<String> = lengths
            .iter()
            .map(|&len| vec!["t"; len].join(" "))
            .collect();
        (
            fixture(&format!("{name}.src"), &source.join("\n")),
            fixture(&format!("{name}.trg"), &target.join("\n")),
        )
    }

    fn new_iterator(name: &str, lengths: &[usize], settings: IteratorSettings) -> TextIterator {
        let (source, target) = numbered_corpus(name, lengths);
        TextIterator::new_builder(&source, &target)
            .with_source_dicts(&[word_dict(&format!("{name}.src.json"), &["s0", "s1", "s2"])])
            .with_target_dict(word_dict(&format!("{name}.trg.json"), &["t"]))
            .with_settings(settings)
            .build()
            .unwrap()
    }

    #[test]
    fn batches_cover_corpus_and_restart() {
        let lengths = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3];
        let settings = IteratorSettings {
            batch_size: 3,
            maxibatch_size: 2,
            ..Default::default()
        };
        let mut iterator = new_iterator("cover", &lengths, settings);

        let first_pass: Vec<Batch> = iterator.by_ref().collect();
        assert_eq!(first_pass.len(), 4);
        assert_eq!(first_pass.iter().map(|x| x.len()).sum::<usize>(), 10);

        let restarted = iterator.next().unwrap();
        assert_eq!(restarted, first_pass[0]);
    }

    #[test]
    fn long_pairs_are_filtered() {
        let settings = IteratorSettings {
            batch_size: 2,
            maxlen: 4,
            ..Default::default()
        };
        let mut iterator = new_iterator("maxlen", &[3, 7, 4, 5, 1], settings);

        let batches: Vec<Batch> = iterator.by_ref().collect();
        let lengths: Vec<usize> = batches
            .iter()
            .flat_map(|x| x.target.iter().map(|t| t.len()))
            .collect();
        assert_eq!(lengths.len(), 3);
        assert!(lengths.iter().all(|&len| len <= 4));
        assert!(batches
            .iter()
            .flat_map(|x| x.source.iter())
            .all(|s| s.len() <= 4));
    }

    #[test]
    fn sorted_maxibatch_pops_longest_first() {
        let lengths = [2, 8, 1, 5, 7, 3];
        let settings = IteratorSettings {
            batch_size: 2,
            maxibatch_size: 3,
            ..Default::default()
        };
        let mut iterator = new_iterator("sorted", &lengths, settings);

        let emitted: Vec<usize> = iterator
            .by_ref()
            .flat_map(|x| x.target.into_iter().map(|t| t.len()))
            .collect();
        assert_eq!(emitted, vec![8, 7, 5, 3, 2, 1]);
    }

    #[test]
    fn unsorted_buffer_keeps_file_order() {
        let settings = IteratorSettings {
            batch_size: 2,
            sort_by_length: false,
            ..Default::default()
        };
        let mut iterator = new_iterator("unsorted", &[2, 8, 1], settings);

        let emitted: Vec<usize> = iterator
            .by_ref()
            .flat_map(|x| x.target.into_iter().map(|t| t.len()))
            .collect();
        assert_eq!(emitted, vec![2, 8, 1]);
    }

    #[test]
    fn tokens_map_to_indices_with_unk() {
        let source = fixture("lookup.src", "the cat|N sat|V|x\n");
        let target = fixture("lookup.trg", "der katze rare\n");
        let mut iterator = TextIterator::new_builder(&source, &target)
            .with_source_dicts(&[
                word_dict("lookup.words.json", &["the", "cat", "sat"]),
                word_dict("lookup.tags.json", &["N", "V"]),
            ])
            .with_target_dict(word_dict("lookup.trg.json", &["der", "katze", "rare"]))
            .with_settings(IteratorSettings {
                use_factor: true,
                n_words_target: Some(4),
                ..Default::default()
            })
            .build()
            .unwrap();

        let batch = iterator.next().unwrap();
        assert_eq!(batch.source, vec![vec![vec![2, UNK], vec![3, 2], vec![4, 3]]]);
        assert_eq!(batch.target, vec![vec![2, 3, UNK]]);
        assert!(iterator.next().is_none());
    }

    #[test]
    fn empty_sides_are_skipped_when_requested() {
        let source = fixture("empty.src", "a b\n\nc\n");
        let target = fixture("empty.trg", "x\ny\n\n");
        let dict = word_dict("empty.json", &["a", "b", "c", "x", "y"]);
        let mut iterator = TextIterator::new_builder(&source, &target)
            .with_source_dicts(&[&dict])
            .with_target_dict(&dict)
            .with_settings(IteratorSettings {
                skip_empty: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let batch = iterator.next().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.target, vec![vec![5]]);
    }

    #[test]
    fn shuffled_passes_keep_pairs_aligned() {
        let source = fixture("shuffle.src", "a\nb\nc\nd\ne\n");
        let target = fixture("shuffle.trg", "a\nb\nc\nd\ne\n");
        let dict = word_dict("shuffle.json", &["a", "b", "c", "d", "e"]);
        let mut iterator = TextIterator::new_builder(&source, &target)
            .with_source_dicts(&[&dict])
            .with_target_dict(&dict)
            .with_batch_size(2)
            .with_shuffler(Box::new(TempFileShuffler::new(RngStrategy::testable(42))))
            .build()
            .unwrap();

        for _ in 0..2 {
            let mut seen = vec![];
            for batch in iterator.by_ref() {
                for (source, target) in batch.source.iter().zip(&batch.target) {
                    assert_eq!(source[0][0], target[0]);
                    seen.push(target[0]);
                }
            }
            seen.sort();
            assert_eq!(seen, vec![2, 3, 4, 5, 6]);
        }
    }

    pub(crate) fn bytes_fixture(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("plane_iterator_{name}"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn read_error_ends_pass_without_misaligning() {
        let source = bytes_fixture("broken.src", b"a\n\xffz\nb\nc\n");
        let target = fixture("broken.trg", "a\nbad\nb\nc\n");
        let dict = word_dict("broken.json", &["a", "bad", "b", "c"]);
        let mut iterator = TextIterator::new_builder(&source, &target)
            .with_source_dicts(&[&dict])
            .with_target_dict(&dict)
            .with_batch_size(1)
            .with_maxibatch_size(4)
            .build()
            .unwrap();

        for _ in 0..2 {
            let pairs: Vec<(usize, usize)> = iterator
                .by_ref()
                .flat_map(|batch| {
                    batch
                        .source
                        .iter()
                        .zip(&batch.target)
                        .map(|(source, target)| (source[0][0], target[0]))
                        .collect::<Vec<_>>()
                })
                .collect();
            assert_eq!(pairs, vec![(2, 2)]);
        }
    }

    #[test]
    fn permute_reorders_by_index() {
        let mut buffer = vec!["a", "b", "c"];
        permute(&mut buffer, &[2, 0, 1]);
        assert_eq!(buffer, vec!["c", "a", "b"]);
    }
}
