use log::{debug, warn};
use std::io::{self, Read, Seek, SeekFrom};

/// 字节数据源
pub trait ByteSource: Send {
    /// 填充 `buf`，返回写入的字节数；返回 0 表示到达流末尾
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// 直接跳过 `count` 个字节，返回实际跳过的数目
    ///
    /// 默认不支持跳过（返回 0），由 [`ByteBuffer`] 读取并丢弃。
    fn skip(&mut self, _count: u64) -> io::Result<u64> {
        Ok(0)
    }
}

/// 任意 `Read` 的数据源（不支持跳过）
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// 可 seek 的数据源，跳过时使用相对 seek
pub struct SeekableSource<R> {
    reader: R,
}

impl<R: Read + Seek + Send> SeekableSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Seek + Send> ByteSource for SeekableSource<R> {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        let offset = i64::try_from(count)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "skip 距离过大"))?;
        self.reader.seek(SeekFrom::Current(offset))?;
        Ok(count)
    }
}

/// 拉取式带缓冲的字节读取器
///
/// 内部窗口耗尽时调用数据源补充数据；数据源返回 0（或出错）后置 `eos`，
/// 此后所有读取都返回 0 字节，`read_u8` 返回 0。调用方应检查 `is_eos()`
/// 而不是依赖返回值。
pub struct ByteBuffer {
    data: Box<[u8]>,
    index: usize,
    length: usize,
    eos: bool,
    consumed: u64,
    source: Box<dyn ByteSource>,
    error: Option<io::Error>,
}

impl ByteBuffer {
    pub fn new(source: impl ByteSource + 'static, capacity: usize) -> Self {
        Self::from_boxed(Box::new(source), capacity)
    }

    pub fn from_boxed(source: Box<dyn ByteSource>, capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            index: 0,
            length: 0,
            eos: false,
            consumed: 0,
            source,
            error: None,
        }
    }

    /// 重新填充内部窗口，返回是否有数据可读
    fn refill(&mut self) -> bool {
        self.index = 0;
        self.length = 0;
        if self.eos {
            return false;
        }

        loop {
            match self.source.fill(&mut self.data) {
                Ok(0) => {
                    debug!("ByteBuffer 到达流末尾（已读取 {} 字节）", self.consumed);
                    self.eos = true;
                    return false;
                }
                Ok(n) => {
                    self.length = n.min(self.data.len());
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("数据源读取失败，按流末尾处理: {}", e);
                    self.error = Some(e);
                    self.eos = true;
                    return false;
                }
            }
        }
    }

    /// 读取最多 `dest.len()` 个字节，返回实际读取数；遇到 EOS 时 `dest` 剩余部分保持不变
    pub fn read_bytes(&mut self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dest.len() {
            if self.index >= self.length && !self.refill() {
                break;
            }
            let n = (self.length - self.index).min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&self.data[self.index..self.index + n]);
            self.index += n;
            self.consumed += n as u64;
            copied += n;
        }
        copied
    }

    pub fn read_u8(&mut self) -> u8 {
        if self.index >= self.length && !self.refill() {
            return 0;
        }
        let byte = self.data[self.index];
        self.index += 1;
        self.consumed += 1;
        byte
    }

    pub fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8() as u16;
        (hi << 8) | self.read_u8() as u16
    }

    pub fn read_u24(&mut self) -> u32 {
        let hi = self.read_u16() as u32;
        (hi << 8) | self.read_u8() as u32
    }

    pub fn read_u32(&mut self) -> u32 {
        let hi = self.read_u16() as u32;
        (hi << 16) | self.read_u16() as u32
    }

    /// 跳过 `count` 个字节
    ///
    /// 缓冲区内的数据足够时只移动游标；否则先用完缓冲区，
    /// 再让数据源跳过剩余部分，数据源跳不完的部分读取并丢弃。
    pub fn skip(&mut self, count: usize) {
        let available = self.length - self.index;
        if count <= available {
            self.index += count;
            self.consumed += count as u64;
            return;
        }

        self.index = self.length;
        self.consumed += available as u64;
        let mut remaining = (count - available) as u64;

        if !self.eos {
            match self.source.skip(remaining) {
                Ok(skipped) => {
                    let skipped = skipped.min(remaining);
                    remaining -= skipped;
                    self.consumed += skipped;
                }
                Err(e) => debug!("数据源无法跳过 {} 字节，改为读取丢弃: {}", remaining, e),
            }
        }

        while remaining > 0 {
            if !self.refill() {
                break;
            }
            let n = (self.length as u64).min(remaining) as usize;
            self.index = n;
            self.consumed += n as u64;
            remaining -= n as u64;
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// 已经消费的字节数（包括跳过的）
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// 取出导致 EOS 的数据源错误（如果有）
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}
