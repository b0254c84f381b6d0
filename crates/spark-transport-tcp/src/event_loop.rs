//! EventLoop：单线程事件循环执行器，基于 `mio` 原生轮询器。
//!
//! # 设计背景（Why）
//! 整个运行时最硬的不变式是"一个通道绑定的所有回调都发生在同一个 OS
//! 线程上"。这里选择 `mio` 作为具体的原生轮询器实现，而不是沿用某个
//! 多线程异步运行时，是因为多线程运行时的任务可能被任意工作线程窃取执行，
//! 天然无法表达"线程亲和"这个约束；`mio::Poll` 配合一个专属 OS 线程、
//! 外加一个 `mio::Waker` 用于从其他线程打断阻塞等待，恰好是"单线程反应堆"
//! 这一类运行时的标准做法。
//!
//! # 逻辑解析（How）
//! 循环体严格按四步走：排干到期的调度任务、运行任务队列直到清空或超过
//! `breakout_interval`、在没有任务时阻塞等待 I/O 就绪或下一个调度截止时间、
//! 周期性检查是否应当结束优雅停机。`schedule()` 从非所有者线程调用时不会
//! 直接碰 `scheduled` 堆（它只允许所有者线程变更），而是把"把这个任务插入
//! 堆"本身包装成一个任务扔进 `task_queue`，在下一次循环迭代里由所有者线程
//! 执行——这样「调度队列只由所有者线程变更」这条约束完全不需要额外加锁。
//!
//! # 契约说明（What）
//! - `shutdown_gracefully` 之后新提交的任务被**拒绝**（返回前已经选定的
//!   策略，而非静默丢弃——见 crate 级 `DESIGN.md` 对该处公开问题的决策）。
//! - 循环线程在首次 `execute()`/构造完成后立即启动，不等待显式的 `start()`
//!   调用。
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use spark_core::error::CoreError;
use spark_core::executor::EventExecutor;
use spark_core::future::{Future as SparkFuture, Promise};
use spark_core::observability::record_swallowed_task_error;
use spark_core::scheduled::{ScheduledHandle, ScheduledTaskQueue};
use spark_core::task::{Runnable, TaskQueue};

const WAKE_TOKEN: Token = Token(usize::MAX);

const STATE_NOT_STARTED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_SHUTDOWN: u8 = 3;
const STATE_TERMINATED: u8 = 4;

/// 事件循环的可调参数：breakout interval 控制一轮任务执行最多占用多久
/// 才回去检查一次 I/O，数值越小响应 I/O 越及时、任务吞吐代价越高。
#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    pub breakout_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            breakout_interval: Duration::from_millis(100),
        }
    }
}

struct Shared {
    task_queue: TaskQueue,
    scheduled: parking_lot::Mutex<ScheduledTaskQueue>,
    state: AtomicU8,
    owner_thread: parking_lot::Mutex<Option<ThreadId>>,
    waker: Waker,
    /// `mio::Registry` 的 register/reregister/deregister 本身就是线程安全的
    /// （`mio::Poll` 的文档保证），所以通道在任意线程上注册自己的 socket
    /// 都不需要回到所有者线程——真正要求单线程的只有 `Poll::poll()` 本身，
    /// 而那只在 `run()` 里、由所有者线程独占调用。
    registry: mio::Registry,
    /// token -> 就绪回调。通道/监听器在向 `registry` 注册自己的 `mio` 源时
    /// 也在这里登记一份回调，循环线程在 `poll()` 返回后据此把就绪事件分派
    /// 给具体的传输实现，而不需要 `EventLoop` 认识任何具体传输类型。
    sources: parking_lot::Mutex<HashMap<Token, Arc<dyn Fn(&mio::event::Event) + Send + Sync>>>,
    config: EventLoopConfig,
    quiet_period: parking_lot::Mutex<Duration>,
    shutdown_timeout: parking_lot::Mutex<Duration>,
    shutdown_requested_at: parking_lot::Mutex<Option<Instant>>,
    last_task_at: parking_lot::Mutex<Instant>,
    termination: Promise<()>,
}

/// 单线程反应堆事件循环：构造时立即启动自己的所有者线程。
pub struct TcpEventLoop {
    shared: Arc<Shared>,
}

impl TcpEventLoop {
    pub fn spawn(config: EventLoopConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            task_queue: TaskQueue::new(),
            scheduled: parking_lot::Mutex::new(ScheduledTaskQueue::new()),
            state: AtomicU8::new(STATE_NOT_STARTED),
            owner_thread: parking_lot::Mutex::new(None),
            waker,
            registry,
            sources: parking_lot::Mutex::new(HashMap::new()),
            config,
            quiet_period: parking_lot::Mutex::new(Duration::ZERO),
            shutdown_timeout: parking_lot::Mutex::new(Duration::ZERO),
            shutdown_requested_at: parking_lot::Mutex::new(None),
            last_task_at: parking_lot::Mutex::new(Instant::now()),
            termination: Promise::new(),
        });

        let run_shared = shared.clone();
        thread::Builder::new()
            .name("spark-event-loop".into())
            .spawn(move || run_shared.run(poll))?;

        Ok(Self { shared })
    }

    /// 克隆的 registry 句柄，供通道/监听器注册自己的 `mio` 源。
    pub fn registry(&self) -> &mio::Registry {
        &self.shared.registry
    }

    /// 登记一个 token 对应的就绪回调。调用方应当已经用同一个 `registry()`
    /// 把自己的 `mio` 源注册到了这个 token 上。
    pub fn register_source(&self, token: Token, callback: Arc<dyn Fn(&mio::event::Event) + Send + Sync>) {
        self.shared.sources.lock().insert(token, callback);
    }

    pub fn deregister_source(&self, token: Token) {
        self.shared.sources.lock().remove(&token);
    }
}

impl Shared {
    fn run(self: Arc<Self>, mut poll: Poll) {
        *self.owner_thread.lock() = Some(thread::current().id());
        self.state.store(STATE_STARTED, Ordering::Release);

        let mut events = Events::with_capacity(1024);
        let mut pending: std::collections::VecDeque<Runnable> = std::collections::VecDeque::new();

        loop {
            let now = Instant::now();

            // 1. 排干到期的调度任务。
            let due = self.scheduled.lock().poll_due(now);
            for task in due {
                let execute = task.execute;
                let promise = task.promise;
                pending.push_back(Box::new(move || {
                    execute();
                    promise.try_complete(());
                }));
            }
            self.task_queue.drain_into(&mut pending);

            // 2. 运行任务直到清空或超过 breakout interval，每 64 个任务复查一次。
            let run_deadline = Instant::now() + self.config.breakout_interval;
            let mut run_count = 0usize;
            while let Some(task) = pending.pop_front() {
                self.run_one(task);
                run_count += 1;
                if run_count % 64 == 0 && Instant::now() >= run_deadline {
                    break;
                }
            }
            if !pending.is_empty() || !self.task_queue.is_empty() {
                *self.last_task_at.lock() = Instant::now();
            }

            // 4. 优雅停机检查。
            if self.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN && self.confirm_shutdown() {
                break;
            }

            // 3. 阻塞等待 I/O 就绪或下一个调度截止时间，二者取较短者。
            let next_deadline = self.scheduled.lock().peek_deadline();
            let wait = match next_deadline {
                Some(deadline) => {
                    let until = deadline.saturating_duration_since(Instant::now());
                    until.min(self.config.breakout_interval)
                }
                None => self.config.breakout_interval,
            };
            // `Poll::poll` 内部会清空并重新填充 `events`，调用方不需要手动清理。
            let _ = poll.poll(&mut events, Some(wait));
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let callback = self.sources.lock().get(&event.token()).cloned();
                if let Some(callback) = callback {
                    callback(event);
                }
            }
        }

        self.state.store(STATE_TERMINATED, Ordering::Release);
        self.termination.try_complete(());
    }

    fn run_one(&self, task: Runnable) {
        // 用户代码里的 panic 绝不能让循环线程死掉；`catch_unwind` 把它转换
        // 成一次记录在案但被吞掉的错误，循环继续运行下一个任务。
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
        if result.is_err() {
            record_swallowed_task_error(&CoreError::rejected());
        }
    }

    fn confirm_shutdown(&self) -> bool {
        let requested_at = match *self.shutdown_requested_at.lock() {
            Some(at) => at,
            None => return false,
        };
        let timeout = *self.shutdown_timeout.lock();
        if requested_at.elapsed() >= timeout {
            return true;
        }
        let quiet = *self.quiet_period.lock();
        self.task_queue.is_empty()
            && self.scheduled.lock().is_empty()
            && self.last_task_at.lock().elapsed() >= quiet
    }

    fn wake_if_foreign(&self) {
        let owner = *self.owner_thread.lock();
        if owner != Some(thread::current().id()) {
            let _ = self.waker.wake();
        }
    }
}

impl EventExecutor for TcpEventLoop {
    fn execute(&self, task: Runnable) {
        if self.shared.state.load(Ordering::Acquire) >= STATE_SHUTTING_DOWN {
            // 策略选定为显式拒绝，见 `DESIGN.md`：提交方能明确知道任务没有
            // 被执行，而不是静默吞掉。
            record_swallowed_task_error(&CoreError::rejected());
            return;
        }
        self.shared.task_queue.push(task);
        self.shared.wake_if_foreign();
    }

    fn schedule(&self, task: Runnable, delay: Duration) -> ScheduledHandle {
        let promise = Promise::new();
        let cancellation = spark_core::scheduled::CancellationToken::new();
        let deadline = Instant::now() + delay;
        let shared = self.shared.clone_for_schedule();
        let push_promise = promise.clone();
        let push_cancellation = cancellation.clone();

        // 调度堆只允许所有者线程变更（§4.3）：从外部线程调用时，把"插入
        // 堆"这件事本身包装成一个任务，交给下一轮循环迭代由所有者线程执行；
        // 取消令牌独立于这次插入提前存在，因此即使任务还在 task_queue 里
        // 排队，`cancel()` 也能立即让句柄的 promise 进入 Cancelled 状态。
        let push = move || {
            shared
                .scheduled
                .lock()
                .push_with_token(deadline, push_cancellation, push_promise, task);
        };

        if self.in_event_loop() {
            push();
        } else {
            self.shared.task_queue.push(Box::new(push));
            self.shared.wake_if_foreign();
        }

        ScheduledHandle {
            cancellation,
            promise,
        }
    }

    fn in_event_loop(&self) -> bool {
        *self.shared.owner_thread.lock() == Some(thread::current().id())
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> SparkFuture<()> {
        // `shutdownGracefullyAsync` 必须是幂等的（S8/§8 性质 7）：不管调用时
        // 循环还没来得及把自己标记为 `Started`，还是已经在 `ShuttingDown`，
        // 这里都只接受"从尚未进入停机的状态第一次进入"这一次转换。
        let mut first_call = false;
        loop {
            let current = self.shared.state.load(Ordering::Acquire);
            if current >= STATE_SHUTTING_DOWN {
                break;
            }
            if self
                .shared
                .state
                .compare_exchange(current, STATE_SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                first_call = true;
                break;
            }
        }
        if first_call {
            *self.shared.quiet_period.lock() = quiet_period;
            *self.shared.shutdown_timeout.lock() = timeout;
            *self.shared.shutdown_requested_at.lock() = Some(Instant::now());
            *self.shared.last_task_at.lock() = Instant::now();
            self.shared.wake_if_foreign();
        }
        self.shared.termination.as_future()
    }

    fn termination_future(&self) -> SparkFuture<()> {
        self.shared.termination.as_future()
    }
}

impl Shared {
    fn clone_for_schedule(self: &Arc<Self>) -> Arc<Shared> {
        self.clone()
    }
}
