use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use tracing::{debug, instrument, warn};

use crate::ml::{RngStrategy, ShuffleRng};

/// Opens a plain or gzip-compressed (`.gz`) text file.
pub fn open_text<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(|x| x.to_string()).collect()
}

/// Line reader over one corpus file that can be rewound to its start.
pub struct CorpusReader {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    temporary: bool,
}

impl CorpusReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_text(&path)?;
        Ok(Self {
            path,
            reader,
            temporary: false,
        })
    }

    /// Reader over a file that is deleted once the reader is dropped.
    pub fn temporary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = Self::open(path)?;
        reader.temporary = true;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset(&mut self) -> Result<()> {
        self.reader = open_text(&self.path)?;
        Ok(())
    }

    /// Next line without its line terminator, `None` at end of file.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .with_context(|| format!("failed to read from {:?}", self.path))?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed_len = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed_len);
        Ok(Some(line))
    }
}

impl Drop for CorpusReader {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(err) = std::fs::remove_file(&self.path) {
                debug!(?err, path = ?self.path, "failed to remove temporary corpus");
            }
        }
    }
}

/// Produces readers over aligned files, all permuted by the same line order.
pub trait ShuffleService {
    fn shuffle(&self, paths: &[PathBuf]) -> Result<Vec<CorpusReader>>;
}

/// Shuffles aligned corpora into temporary files, removed when their readers drop.
pub struct TempFileShuffler {
    rng: RngStrategy,
    dir: PathBuf,
}

static SHUFFLE_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl TempFileShuffler {
    pub fn new(rng: RngStrategy) -> Self {
        Self {
            rng: rng.upgrade(),
            dir: std::env::temp_dir(),
        }
    }

    pub fn with_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.dir = dir.as_ref().to_path_buf();
        self
    }

    fn temp_path(&self, original: &Path) -> PathBuf {
        let name = original
            .file_name()
            .map(|x| x.to_string_lossy().trim_end_matches(".gz").to_string())
            .unwrap_or_else(|| "corpus".to_string());
        let counter = SHUFFLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{name}.{}.{counter}.shuf", std::process::id()))
    }
}

impl Default for TempFileShuffler {
    fn default() -> Self {
        Self::new(RngStrategy::default())
    }
}

impl ShuffleService for TempFileShuffler {
    #[instrument(level = "debug", skip(self))]
    fn shuffle(&self, paths: &[PathBuf]) -> Result<Vec<CorpusReader>> {
        let contents = paths
            .iter()
            .map(|path| {
                open_text(path)?
                    .lines()
                    .collect::<std::io::Result<Vec<String>>>()
                    .with_context(|| format!("failed to read {path:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let line_count = contents.first().map(|x| x.len()).unwrap_or_default();
        if let Some((path, lines)) = paths
            .iter()
            .zip(&contents)
            .find(|(_, lines)| lines.len() != line_count)
        {
            return Err(anyhow!(
                "can not shuffle {path:?} with {} lines alongside {line_count} lines",
                lines.len()
            ));
        }

        let mut order: Vec<usize> = (0..line_count).collect();
        self.rng.shuffle_vec(&mut order);

        let mut readers = Vec::with_capacity(paths.len());
        for (path, lines) in paths.iter().zip(&contents) {
            let temp_path = self.temp_path(path);
            let mut writer = BufWriter::new(
                File::create(&temp_path)
                    .with_context(|| format!("failed to create {temp_path:?}"))?,
            );
            for &idx in &order {
                writeln!(writer, "{}", lines[idx])?;
            }
            writer.flush()?;
            readers.push(CorpusReader::temporary(&temp_path)?);
        }
        debug!(line_count, "shuffled corpora");
        Ok(readers)
    }
}

/// Aligned corpus files read in lock-step, line `i` of each forming one example.
pub struct ParallelCorpus {
    paths: Vec<PathBuf>,
    readers: Vec<CorpusReader>,
    shuffler: Option<Box<dyn ShuffleService>>,
}

impl ParallelCorpus {
    pub fn open(paths: Vec<PathBuf>, shuffler: Option<Box<dyn ShuffleService>>) -> Result<Self> {
        let readers = match &shuffler {
            Some(shuffler) => shuffler.shuffle(&paths)?,
            None => paths
                .iter()
                .map(CorpusReader::open)
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Self {
            paths,
            readers,
            shuffler,
        })
    }

    pub fn width(&self) -> usize {
        self.paths.len()
    }

    /// Rewinds every file, reshuffling them when a shuffle service is configured.
    pub fn reset(&mut self) -> Result<()> {
        match &self.shuffler {
            Some(shuffler) => {
                // the previous temporary files are removed as their readers drop
                self.readers = shuffler.shuffle(&self.paths)?;
            }
            None => {
                for reader in &mut self.readers {
                    reader.reset()?;
                }
            }
        }
        Ok(())
    }

    /// Next line of every file, `None` once the first file is exhausted.
    pub fn next_lines(&mut self) -> Result<Option<Vec<String>>> {
        let mut lines = Vec::with_capacity(self.readers.len());
        let mut readers = self.readers.iter_mut();

        match readers.next() {
            Some(first) => match first.read_line()? {
                Some(line) => lines.push(line),
                None => return Ok(None),
            },
            None => return Ok(None),
        }
        for reader in readers {
            match reader.read_line()? {
                Some(line) => lines.push(line),
                None => {
                    return Err(anyhow!(
                        "{:?} ended before {:?}",
                        reader.path(),
                        self.paths.first()
                    ))
                }
            }
        }
        Ok(Some(lines))
    }
}

/// Reads the next aligned lines, treating read failures as the end of input.
pub(crate) fn next_lines_or_end(corpus: &mut ParallelCorpus) -> Option<Vec<String>> {
    match corpus.next_lines() {
        Ok(lines) => lines,
        Err(err) => {
            warn!("ending corpus pass early: {err:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::{write::GzEncoder, Compression};
    use test_log::test;

    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reader_strips_terminators_and_rewinds() {
        let path = temp_file("plane_corpus_reader_rewinds.txt", "a b\r\nc\n\nd");
        let mut reader = CorpusReader::open(&path).unwrap();

        assert_eq!(reader.read_line().unwrap().as_deref(), Some("a b"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("c"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("d"));
        assert_eq!(reader.read_line().unwrap(), None);

        reader.reset().unwrap();
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("a b"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn gzip_files_are_decompressed() {
        let path = std::env::temp_dir().join("plane_corpus_gzip_files.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"hello world\n").unwrap();
        encoder.finish().unwrap();

        let mut text = String::new();
        open_text(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello world\n");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn shuffler_permutes_files_identically() {
        let source = temp_file("plane_shuffle_source.txt", "0\n1\n2\n3\n4\n5\n6\n7\n");
        let target = temp_file("plane_shuffle_target.txt", "t0\nt1\nt2\nt3\nt4\nt5\nt6\nt7\n");
        let shuffler = TempFileShuffler::new(RngStrategy::testable(1234));

        let mut corpus = ParallelCorpus::open(
            vec![source.clone(), target.clone()],
            Some(Box::new(shuffler)),
        )
        .unwrap();

        let mut seen = vec![];
        while let Some(lines) = corpus.next_lines().unwrap() {
            assert_eq!(format!("t{}", lines[0]), lines[1]);
            seen.push(lines[0].clone());
        }
        seen.sort();
        assert_eq!(seen, (0..8).map(|x| x.to_string()).collect::<Vec<_>>());

        corpus.reset().unwrap();
        assert!(corpus.next_lines().unwrap().is_some());
        std::fs::remove_file(&source).ok();
        std::fs::remove_file(&target).ok();
    }

    #[test]
    fn shorter_aligned_file_is_an_error() {
        let source = temp_file("plane_parallel_short_source.txt", "a\nb\n");
        let target = temp_file("plane_parallel_short_target.txt", "x\n");
        let mut corpus = ParallelCorpus::open(vec![source.clone(), target.clone()], None).unwrap();

        assert!(corpus.next_lines().unwrap().is_some());
        assert!(corpus.next_lines().is_err());
        assert_eq!(next_lines_or_end(&mut corpus), None);
        std::fs::remove_file(&source).ok();
        std::fs::remove_file(&target).ok();
    }
}
