use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::statsd::SystemGauges;

/// Interval for recording backlog metrics on service channels.
const BACKLOG_INTERVAL: Duration = Duration::from_secs(1);

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented on
/// a single message. For each individual message, this type needs to implement the [`FromMessage`]
/// trait.
///
/// # Implementating Interfaces
///
/// There are three main ways to implement interfaces, which depends on the number of messages and
/// their return values:
///
/// - For messages without a response, use [`NoResponse`].
/// - For messages that respond asynchronously, use [`AsyncResponse`] and pass the [`Sender`] along
///   with the message.
/// - Services without messages use the unit type `()` as interface.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to interface messages, such as through
/// asynchronous responses or fire-and-forget without responding.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    ///
    /// This type can be either synchronous and asynchronous based on the responder.
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending an asynchronous message to a service.
///
/// This is returned from [`Addr::send`] when the message responds asynchronously through
/// [`AsyncResponse`]. It is a future that should be awaited. The message still runs to
/// completion if this future is dropped.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender is part of an [`AsyncResponse`] and should be moved into the service interface
/// type. If this sender is dropped without calling [`send`](Self::send), the request fails with
/// [`SendError`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// This silently drops the value if the request has been dropped.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// Message response resulting in an asynchronous [`Request`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct AsyncResponse<T>(PhantomData<fn(T)>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages with no output.
///
/// There is no sender associated to this response. When implementing [`FromMessage`], the sender
/// can be ignored.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` type that determines the return value of sending the
/// message. Within an interface, the responder can vary for each message.
///
/// # Example
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Sender};
///
/// struct GetCount;
/// struct Increment;
///
/// enum Counter {
///     GetCount(GetCount, Sender<u64>),
///     Increment(Increment),
/// }
///
/// impl Interface for Counter {}
///
/// impl FromMessage<GetCount> for Counter {
///     type Response = AsyncResponse<u64>;
///
///     fn from_message(message: GetCount, sender: Sender<u64>) -> Self {
///         Self::GetCount(message, sender)
///     }
/// }
///
/// impl FromMessage<Increment> for Counter {
///     type Response = NoResponse;
///
///     fn from_message(message: Increment, _: ()) -> Self {
///         Self::Increment(message)
///     }
/// }
/// ```
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// Abstraction over address types for service channels.
trait SendDispatch<M>: Send + Sync {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Sends a message to the service and returns the response.
    fn send(&self, message: M) -> <Self::Response as MessageResponse>::Output;

    /// Returns a trait object of this type.
    fn to_trait_object(&self) -> Box<dyn SendDispatch<M, Response = Self::Response>>;
}

/// An address to a [`Service`] implementing any interface that takes a given message.
///
/// This is similar to an [`Addr`], but it is bound to a single message rather than an interface.
/// As such, this type is not generic over the [`Service`] or [`Interface`] but only the message.
/// Use [`Addr::recipient`] to construct this type.
pub struct Recipient<M, R: MessageResponse> {
    inner: Box<dyn SendDispatch<M, Response = R>>,
}

impl<M, R: MessageResponse> Recipient<M, R> {
    /// Sends a message to the service and returns the response.
    ///
    /// This is equivalent to [`send`](Addr::send) on the originating address.
    pub fn send(&self, message: M) -> R::Output {
        self.inner.send(message)
    }
}

impl<M, R: MessageResponse> Clone for Recipient<M, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.to_trait_object(),
        }
    }
}

impl<M, R: MessageResponse> fmt::Debug for Recipient<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Recipient")
    }
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running.
///
/// Addresses can be freely cloned. When the last clone of an address is dropped, the message
/// channel of the service closes permanently, which signals to the service that it can shut down.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this either returns a future resolving to the
    /// return value, or does not return anything for fire-and-forget messages. The communication
    /// channel with the service is unbounded, so backlogs could occur when sending too many
    /// messages.
    ///
    /// Sending asynchronous messages can fail with `Err(SendError)` if the service has shut down.
    /// The result of asynchronous messages does not have to be awaited. The message will be
    /// delivered and handled regardless.
    pub fn send<M>(
        &self,
        message: M,
    ) -> <<I as FromMessage<M>>::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = <I as FromMessage<M>>::Response::channel();
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        self.tx.send(I::from_message(message, tx)).ok();
        rx
    }

    /// Returns a handle that can receive a given message independent of the interface.
    ///
    /// See [`Recipient`] for more information and examples.
    pub fn recipient<M>(self) -> Recipient<M, <I as FromMessage<M>>::Response>
    where
        I: FromMessage<M>,
    {
        Recipient {
            inner: Box::new(self),
        }
    }

    /// Returns whether the service has stopped receiving messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Custom address used for testing.
    ///
    /// Returns the receiving end of the channel for inspection.
    pub fn custom() -> (Self, mpsc::UnboundedReceiver<I>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Addr {
                tx,
                queue_size: Default::default(),
            },
            rx,
        )
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

// Manually derive `Clone` since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue_size: self.queue_size.clone(),
        }
    }
}

impl<I, M> SendDispatch<M> for Addr<I>
where
    I: Interface + FromMessage<M>,
{
    type Response = <I as FromMessage<M>>::Response;

    fn send(&self, message: M) -> <Self::Response as MessageResponse>::Output {
        Addr::send(self, message)
    }

    fn to_trait_object(&self) -> Box<dyn SendDispatch<M, Response = Self::Response>> {
        Box::new(self.clone())
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`].
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    name: &'static str,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// This method returns `None` if the channel has been closed and there are no remaining
    /// messages in the channel's buffer. The channel is closed when all senders have been dropped.
    ///
    /// This method is cancel safe, so it can be used in `tokio::select!`.
    pub async fn recv(&mut self) -> Option<I> {
        let value = self.rx.recv().await?;
        self.queue_size.fetch_sub(1, Ordering::SeqCst);
        Some(value)
    }

    /// Returns the name of the service owning this receiver.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
///
/// The `Addr` as the sending part provides public access to the service, while the `Receiver`
/// should remain internal to the service.
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        queue_size: queue_size.clone(),
    };

    let receiver = Receiver {
        rx,
        name,
        queue_size,
    };

    (addr, receiver)
}

/// Reports the backlog of a service channel once per second, until the channel closes.
fn spawn_backlog_monitor<I: Interface>(addr: &Addr<I>, name: &'static str) {
    let tx = addr.tx.downgrade();
    let queue_size = addr.queue_size.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BACKLOG_INTERVAL);

        loop {
            ticker.tick().await;

            match tx.upgrade() {
                Some(tx) if !tx.is_closed() => (),
                _ => break,
            }

            tally_statsd::metric!(
                gauge(SystemGauges::ServiceBackPressure) = queue_size.load(Ordering::Relaxed),
                service = name
            );
        }
    });
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle
/// them one by one. Internally, services are free to concurrently process these messages or not,
/// most probably should.
///
/// Individual messages can have a response which will be sent once the message is handled by
/// the service. The sender can asynchronously await the responses of such messages.
///
/// To start a service, create an instance of the service and use [`Service::start_detached`] or
/// [`ServiceRunner::start`].
///
/// # Implementing Services
///
/// The standard way to implement services is through the `run` function. It receives an inbound
/// channel for all messages sent through the service's address. Note that this function is
/// synchronous, so that this needs to spawn at least one task internally:
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service};
///
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         while let Some(message) = rx.recv().await {
///             // handle the message
///         }
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let addr = MyService.start_detached();
/// addr.send(MyMessage);
/// # }
/// ```
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    ///
    /// The interface can be a single message type or an enumeration of all the messages that
    /// can be handled by this service.
    type Interface: Interface;

    /// Defines the main task of this service.
    ///
    /// `run` typically contains a loop that reads from `rx`, or a `select!` that reads from
    /// multiple sources at once.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Starts the service in the current runtime and returns an address for it.
    ///
    /// The service runs until the last address is dropped or it returns from `run`. Its task
    /// cannot be joined, prefer [`ServiceRunner::start`] for services that participate in
    /// shutdown.
    fn start_detached(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        spawn_backlog_monitor(&addr, Self::name());
        tokio::spawn(self.run(rx));
        addr
    }

    /// Returns a unique name for this service implementation.
    ///
    /// This is used for internal diagnostics and uses the fully qualified type name of the service
    /// implementor by default.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Keeps track of running services.
///
/// Exposes information about crashed services.
#[derive(Debug, Default)]
pub struct ServiceRunner(FuturesUnordered<JoinHandle<()>>);

impl ServiceRunner {
    /// Creates a new service runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new service and returns its address.
    pub fn start<S: Service>(&mut self, service: S) -> Addr<S::Interface> {
        let (addr, rx) = channel(S::name());
        spawn_backlog_monitor(&addr, S::name());
        self.0.push(tokio::spawn(service.run(rx)));
        addr
    }

    /// Returns the number of services that have not finished yet.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if all services have finished.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Awaits until all services have finished.
    ///
    /// A panic in one of the services is resumed on the caller, so that invariant violations reach
    /// the process boundary instead of leaving the system half alive.
    pub async fn join(&mut self) {
        while let Some(result) = self.0.next().await {
            if let Err(error) = result
                && error.is_panic()
            {
                std::panic::resume_unwind(error.into_panic());
            }
        }
    }
}
