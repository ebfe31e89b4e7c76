use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use super::{
    corpus::{next_lines_or_end, tokenize, ParallelCorpus},
    iterator::{permute, IteratorSettings},
    vocab::Vocab,
};

pub use builder::MultiSourceTextIteratorBuilder;

/// One minibatch of a dual-source corpus, every field aligned by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiSourceBatch {
    pub source1: Vec<Vec<Vec<usize>>>,
    pub source2: Vec<Vec<Vec<usize>>>,
    pub target: Vec<Vec<usize>>,
    pub align1: Option<Vec<String>>,
    pub align2: Option<Vec<String>>,
}

impl MultiSourceBatch {
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

#[derive(Default)]
struct Buffers {
    source1: Vec<Vec<String>>,
    source2: Vec<Vec<String>>,
    target: Vec<Vec<String>>,
    align1: Vec<String>,
    align2: Vec<String>,
}

impl Buffers {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn assert_synchronized(&self, with_align: (bool, bool)) {
        assert_eq!(self.source1.len(), self.target.len(), "buffer size mismatch");
        assert_eq!(self.source2.len(), self.target.len(), "buffer size mismatch");
        if with_align.0 {
            assert_eq!(self.align1.len(), self.target.len(), "buffer size mismatch");
        }
        if with_align.1 {
            assert_eq!(self.align2.len(), self.target.len(), "buffer size mismatch");
        }
    }
}

/// Streams minibatches from two aligned source corpora and one target corpus,
/// optionally carrying two alignment streams through untouched.
pub struct MultiSourceTextIterator {
    corpus: ParallelCorpus,
    source_dicts: Vec<Vocab>,
    target_dict: Vocab,
    settings: IteratorSettings,
    with_align: (bool, bool),
    buffers: Buffers,
    end_of_data: bool,
}

impl MultiSourceTextIterator {
    pub fn new_builder<P: AsRef<Path>>(
        source1: P,
        source2: P,
        target: P,
    ) -> MultiSourceTextIteratorBuilder {
        MultiSourceTextIteratorBuilder::new(source1.as_ref(), source2.as_ref(), target.as_ref())
    }

    pub fn settings(&self) -> &IteratorSettings {
        &self.settings
    }

    #[instrument(level = "debug", skip(self))]
    pub fn reset(&mut self) -> Result<()> {
        self.buffers.clear();
        self.end_of_data = false;
        self.corpus.reset()
    }

    fn fill(&mut self) {
        let capacity = self.settings.buffer_capacity();
        while self.buffers.target.len() < capacity {
            let Some(mut lines) = next_lines_or_end(&mut self.corpus) else {
                self.end_of_data = true;
                break;
            };
            let source1 = tokenize(&lines[0]);
            let source2 = tokenize(&lines[1]);
            let target = tokenize(&lines[2]);
            if self.settings.rejects(&[&source1, &source2, &target]) {
                continue;
            }

            // alignment lines follow the three text streams in corpus order
            let mut extra = lines.drain(3..);
            if self.with_align.0 {
                self.buffers.align1.push(extra.next().unwrap_or_default());
            }
            if self.with_align.1 {
                self.buffers.align2.push(extra.next().unwrap_or_default());
            }
            self.buffers.source1.push(source1);
            self.buffers.source2.push(source2);
            self.buffers.target.push(target);
        }

        let order = self.settings.buffer_order(&self.buffers.target);
        permute(&mut self.buffers.source1, &order);
        permute(&mut self.buffers.source2, &order);
        permute(&mut self.buffers.target, &order);
        if self.with_align.0 {
            permute(&mut self.buffers.align1, &order);
        }
        if self.with_align.1 {
            permute(&mut self.buffers.align2, &order);
        }
        debug!(buffered = self.buffers.target.len(), "filled lookahead buffer");
    }

    fn end_pass(&mut self) {
        if let Err(err) = self.reset() {
            warn!("failed to reset corpus: {err:#}");
        }
    }
}

impl Iterator for MultiSourceTextIterator {
    type Item = MultiSourceBatch;

    fn next(&mut self) -> Option<MultiSourceBatch> {
        self.buffers.assert_synchronized(self.with_align);
        if self.buffers.target.is_empty() {
            if self.end_of_data {
                self.end_pass();
                return None;
            }
            self.fill();
            if self.buffers.target.is_empty() {
                self.end_pass();
                return None;
            }
        }

        let mut batch = MultiSourceBatch {
            align1: self.with_align.0.then(Vec::new),
            align2: self.with_align.1.then(Vec::new),
            ..Default::default()
        };
        while batch.len() < self.settings.batch_size {
            let Some(target) = self.buffers.target.pop() else {
                break;
            };
            let (Some(source1), Some(source2)) =
                (self.buffers.source1.pop(), self.buffers.source2.pop())
            else {
                break;
            };
            let settings = &self.settings;
            batch
                .source1
                .push(settings.map_source(&source1, &self.source_dicts, 0));
            batch
                .source2
                .push(settings.map_source(&source2, &self.source_dicts, 1));
            batch.target.push(settings.map_target(&target, &self.target_dict));

            if let (Some(align), Some(line)) = (batch.align1.as_mut(), self.buffers.align1.pop()) {
                align.push(line);
            }
            if let (Some(align), Some(line)) = (batch.align2.as_mut(), self.buffers.align2.pop()) {
                align.push(line);
            }
        }
        self.buffers.assert_synchronized(self.with_align);
        Some(batch)
    }
}

mod builder {
    use std::path::{Path, PathBuf};

    use anyhow::{anyhow, Result};

    use crate::ml::{
        data::{
            corpus::{ParallelCorpus, ShuffleService, TempFileShuffler},
            iterator::{load_dicts, IteratorSettings},
        },
        RngStrategy,
    };

    use super::{Buffers, MultiSourceTextIterator};

    pub struct MultiSourceTextIteratorBuilder {
        source1: PathBuf,
        source2: PathBuf,
        target: PathBuf,
        align1: Option<PathBuf>,
        align2: Option<PathBuf>,
        source_dicts: Vec<PathBuf>,
        target_dict: Option<PathBuf>,
        settings: IteratorSettings,
        shuffler: Option<Box<dyn ShuffleService>>,
    }

    impl MultiSourceTextIteratorBuilder {
        pub fn new(source1: &Path, source2: &Path, target: &Path) -> Self {
            Self {
                source1: source1.to_path_buf(),
                source2: source2.to_path_buf(),
                target: target.to_path_buf(),
                align1: None,
                align2: None,
                source_dicts: vec![],
                target_dict: None,
                settings: IteratorSettings::default(),
                shuffler: None,
            }
        }

        pub fn build(self) -> Result<MultiSourceTextIterator> {
            self.settings.validate()?;
            let target_dict = self
                .target_dict
                .ok_or_else(|| anyhow!("missing target vocabulary"))?;
            let required_dicts = if self.settings.use_factor { 1 } else { 2 };
            if self.source_dicts.len() < required_dicts {
                return Err(anyhow!(
                    "expected at least {required_dicts} source vocabularies, got {}",
                    self.source_dicts.len()
                ));
            }
            let (source_dicts, target_dict) =
                load_dicts(&self.source_dicts, &target_dict, &self.settings)?;

            let with_align = (self.align1.is_some(), self.align2.is_some());
            let mut paths = vec![self.source1, self.source2, self.target];
            paths.extend(self.align1);
            paths.extend(self.align2);

            let shuffler = match (self.settings.shuffle_each_epoch, self.shuffler) {
                (true, Some(shuffler)) => Some(shuffler),
                (true, None) => Some(Box::new(TempFileShuffler::new(RngStrategy::default()))
                    as Box<dyn ShuffleService>),
                (false, _) => None,
            };
            let corpus = ParallelCorpus::open(paths, shuffler)?;

            Ok(MultiSourceTextIterator {
                corpus,
                source_dicts,
                target_dict,
                settings: self.settings,
                with_align,
                buffers: Buffers::default(),
                end_of_data: false,
            })
        }

        /// Vocabularies per source factor; unfactored input reads the second source with the second entry.
        pub fn with_source_dicts<P: AsRef<Path>>(mut self, source_dicts: &[P]) -> Self {
            self.source_dicts = source_dicts.iter().map(|x| x.as_ref().to_path_buf()).collect();
            self
        }

        pub fn with_target_dict<P: AsRef<Path>>(mut self, target_dict: P) -> Self {
            self.target_dict = Some(target_dict.as_ref().to_path_buf());
            self
        }

        pub fn with_alignments<P: AsRef<Path>>(mut self, align1: Option<P>, align2: Option<P>) -> Self {
            self.align1 = align1.map(|x| x.as_ref().to_path_buf());
            self.align2 = align2.map(|x| x.as_ref().to_path_buf());
            self
        }

        pub fn with_settings(mut self, settings: IteratorSettings) -> Self {
            self.settings = settings;
            self
        }

        pub fn with_shuffler(mut self, shuffler: Box<dyn ShuffleService>) -> Self {
            self.settings.shuffle_each_epoch = true;
            self.shuffler = Some(shuffler);
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::data::iterator::tests::{bytes_fixture, fixture, word_dict};

    use super::*;

    fn new_iterator(name: &str, with_align: bool, settings: IteratorSettings) -> MultiSourceTextIterator {
        let source1 = fixture(&format!("{name}.src1"), "a b\na\na b c d e\nb\nc c c\n");
        let source2 = fixture(&format!("{name}.src2"), "x\nx y\ny\nx y z w v\nz\n");
        let target = fixture(&format!("{name}.trg"), "t\nt t\nt t t\nt\nt t t t\n");
        let align1 = fixture(&format!("{name}.al1"), "0-0\n1-1\n2-2\n3-3\n4-4\n");
        let align2 = fixture(&format!("{name}.al2"), "a\nb\nc\nd\ne\n");

        let builder = MultiSourceTextIterator::new_builder(&source1, &source2, &target)
            .with_source_dicts(&[
                word_dict(&format!("{name}.src1.json"), &["a", "b", "c"]),
                word_dict(&format!("{name}.src2.json"), &["x", "y", "z"]),
            ])
            .with_target_dict(word_dict(&format!("{name}.trg.json"), &["t"]))
            .with_settings(settings);
        let builder = if with_align {
            builder.with_alignments(Some(&align1), Some(&align2))
        } else {
            builder
        };
        builder.build().unwrap()
    }

    #[test]
    fn all_sides_respect_maxlen() {
        let settings = IteratorSettings {
            batch_size: 2,
            maxlen: 3,
            ..Default::default()
        };
        let mut iterator = new_iterator("multi_maxlen", false, settings);

        let batches: Vec<MultiSourceBatch> = iterator.by_ref().collect();
        assert_eq!(batches.iter().map(|x| x.len()).sum::<usize>(), 2);
        for batch in &batches {
            assert_eq!(batch.source1.len(), batch.len());
            assert_eq!(batch.source2.len(), batch.len());
            assert!(batch.source1.iter().all(|x| x.len() <= 3));
            assert!(batch.source2.iter().all(|x| x.len() <= 3));
            assert!(batch.target.iter().all(|x| x.len() <= 3));
            assert!(batch.align1.is_none());
        }
    }

    #[test]
    fn second_source_uses_second_vocabulary() {
        let mut iterator = new_iterator("multi_vocab", false, IteratorSettings::default());

        let batch = iterator.next().unwrap();
        let pairs: Vec<(usize, usize)> = batch
            .source1
            .iter()
            .zip(&batch.source2)
            .map(|(s1, s2)| (s1.len(), s2[0][0]))
            .collect();
        // sorted by target length then popped from the end
        assert_eq!(pairs, vec![(3, 4), (5, 3), (1, 2), (1, 2), (2, 2)]);
    }

    #[test]
    fn alignments_stay_aligned_with_examples() {
        let settings = IteratorSettings {
            batch_size: 2,
            ..Default::default()
        };
        let mut iterator = new_iterator("multi_align", true, settings);

        let mut seen = vec![];
        for batch in iterator.by_ref() {
            let align1 = batch.align1.unwrap();
            let align2 = batch.align2.unwrap();
            assert_eq!(align1.len(), batch.target.len());
            for ((align, letter), target) in align1.iter().zip(&align2).zip(&batch.target) {
                seen.push((align.clone(), letter.clone(), target.len()));
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("0-0".to_string(), "a".to_string(), 1),
                ("1-1".to_string(), "b".to_string(), 2),
                ("2-2".to_string(), "c".to_string(), 3),
                ("3-3".to_string(), "d".to_string(), 1),
                ("4-4".to_string(), "e".to_string(), 4),
            ]
        );
        assert!(iterator.next().is_some());
    }

    #[test]
    fn read_error_ends_pass_without_misaligning() {
        let source1 = fixture("multi_broken.src1", "a\nbad\nb\nc\n");
        let source2 = bytes_fixture("multi_broken.src2", b"x\n\xffz\ny\nz\n");
        let target = fixture("multi_broken.trg", "t\nt t\nt t t\nt t t t\n");
        let mut iterator = MultiSourceTextIterator::new_builder(&source1, &source2, &target)
            .with_source_dicts(&[
                word_dict("multi_broken.src1.json", &["a", "bad", "b", "c"]),
                word_dict("multi_broken.src2.json", &["x", "y", "z"]),
            ])
            .with_target_dict(word_dict("multi_broken.trg.json", &["t"]))
            .with_settings(IteratorSettings {
                batch_size: 1,
                maxibatch_size: 4,
                ..Default::default()
            })
            .build()
            .unwrap();

        for _ in 0..2 {
            let rows: Vec<(usize, usize, usize)> = iterator
                .by_ref()
                .flat_map(|batch| {
                    (0..batch.len())
                        .map(|i| (batch.source1[i][0][0], batch.source2[i][0][0], batch.target[i].len()))
                        .collect::<Vec<_>>()
                })
                .collect();
            assert_eq!(rows, vec![(2, 2, 1)]);
        }
    }
}
