pub mod corpus;
pub mod iterator;
pub mod multi;
pub mod prepare;
pub mod vocab;

pub use corpus::{CorpusReader, ParallelCorpus, ShuffleService, TempFileShuffler};
pub use iterator::{Batch, IteratorSettings, TextIterator};
pub use multi::{MultiSourceBatch, MultiSourceTextIterator};
pub use prepare::{prepare_data, PreparedBatch, TokenGrid};
pub use vocab::{Vocab, EOS, UNK};
