use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// 线程安全的 FIFO 阻塞队列
///
/// - capacity == 0：无界
/// - capacity > 0：固定容量，满时 `enqueue_blocking` 阻塞（背压）
///
/// 队列不检查元素内容，元素所有权随入队/出队转移。
/// `close()` 之后所有阻塞调用立即返回，用于关闭时唤醒工作线程。
pub struct BlockingQueue<T> {
    inner: Mutex<QueueInner<T>>,
    /// 有空位
    not_full: Condvar,
    /// 有元素
    not_empty: Condvar,
    capacity: usize,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> QueueInner<T> {
    fn is_full(&self, capacity: usize) -> bool {
        capacity > 0 && self.items.len() >= capacity
    }
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// 非阻塞入队，队列已满或已关闭时把元素交还给调用方
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.is_full(self.capacity) {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 非阻塞出队
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        drop(inner);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// 阻塞直到有空位再入队；队列已关闭时返回 Err(item)
    pub fn enqueue_blocking(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.is_full(self.capacity) {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 阻塞直到有元素再出队；队列已关闭时返回 None
    pub fn dequeue_blocking(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.is_empty() {
            self.not_empty.wait(&mut inner);
        }
        if inner.closed {
            return None;
        }
        let item = inner.items.pop_front();
        drop(inner);
        self.not_full.notify_one();
        item
    }

    /// 关闭队列并唤醒所有等待者，队列中剩余的元素被丢弃
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// 查看队首但不移除
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().items.front().cloned()
    }
}
